// SPDX-License-Identifier: MIT

//! The Overseer engine: sensor probes, the online policy, the rule
//! engine, the sensor bus, the context manager, and the tunnel and
//! companion supervisors (spec.md §4.A-§4.F). The daemon crate wires
//! these together with the RPC listener and reload orchestrator; this
//! crate has no knowledge of the control socket or process lifecycle.

pub mod bus;
pub mod companion_supervisor;
pub mod context;
mod error;
pub mod online;
pub mod probes;
pub mod rule_engine;
pub mod tunnel_supervisor;

pub use error::EngineError;

pub use bus::{refresh_online, run as run_bus, SensorMap};
pub use companion_supervisor::{
    run as run_companion, CompanionCommand, CompanionHandle, CompanionRegistry, SharedCompanionState,
};
pub use context::{ContextManager, OnContextChange};
pub use online::{OnlinePolicy, TcpPriorityPolicy};
pub use probes::{run_probe_loop, Probe, SleepGate};
pub use rule_engine::evaluate as evaluate_rules;
pub use tunnel_supervisor::{
    run as run_tunnel, BackoffSchedule, SharedTunnelState, SshOptions, TunnelCommand, TunnelHandle, TunnelRegistry,
};

// SPDX-License-Identifier: MIT

//! Data model shared across the Overseer daemon: sensor readings,
//! condition trees, locations, rules, tunnel/companion state, the
//! export bundle, and the append-only event log.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod clock;
pub mod companion;
pub mod condition;
pub mod error;
pub mod event;
pub mod export;
pub mod id;
pub mod location;
pub mod ring;
pub mod rule;
pub mod sensor;
pub mod tunnel;

pub use clock::{Clock, FakeClock, SystemClock};
pub use companion::{CompanionLifecycleState, CompanionOutputLine, CompanionState};
pub use condition::{CidrPattern, Condition, Pattern, ReadingsView};
pub use error::CoreError;
pub use event::{ContextTransition, DaemonEventKind, Event, TunnelEventKind};
pub use export::{ExportBundle, ExportShape, ExportTarget, PreferredIpVersion, ScalarField};
pub use id::{FixedIdGen, IdGen, NanoIdGen};
pub use location::Location;
pub use ring::LineRing;
pub use rule::{Rule, RuleActions, RuleResult};
pub use sensor::{names as sensor_names, SensorReading, OFFLINE_SENTINEL_V4, OFFLINE_SENTINEL_V6};
pub use tunnel::{CompanionDescriptor, TunnelDescriptor, TunnelDesired, TunnelLifecycleState, TunnelState};

// SPDX-License-Identifier: MIT

//! The parsed-configuration tree: daemon/probe settings, locations,
//! rules, tunnels, and export targets. This crate does not parse the
//! user's HCL source; it defines the struct tree an external loader
//! deserializes into (via `hcl-rs`'s serde bridge) and validates the
//! cross-references between its parts.

mod config;
mod daemon;
mod duration;
mod error;
mod load;

pub use config::Config;
pub use daemon::{DaemonConfig, ProbeConfig};
pub use duration::ConfigDuration;
pub use error::ConfigError;
pub use load::{load_file, load_str};

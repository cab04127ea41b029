// SPDX-License-Identifier: MIT

//! Append-only persistence (G): the SQLite-backed event store and the
//! reload-state snapshot used to adopt tunnels across a daemon restart.

mod error;
mod reload_state;
mod store;

pub use error::StorageError;
pub use reload_state::{ReloadState, TunnelSnapshot};
pub use store::Store;

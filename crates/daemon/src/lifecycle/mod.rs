// SPDX-License-Identifier: MIT

//! Daemon lifecycle: resolving paths, acquiring the single-instance
//! lock, and the shared state every listener connection and background
//! task reaches through.

mod startup;

pub use startup::{cleanup_on_failure, startup, StartupResult};

use overseer_core::{NanoIdGen, SystemClock};
use overseer_engine::{CompanionRegistry, ContextManager, SensorMap, TunnelRegistry};
use overseer_storage::Store;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not determine a state directory (no $HOME)")]
    NoStateDir,

    #[error("failed to acquire daemon lock")]
    LockFailed(#[source] io::Error),

    #[error("failed to bind control socket at {0}")]
    BindFailed(PathBuf, #[source] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] overseer_config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] overseer_storage::StorageError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Every path the daemon touches, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub version_path: PathBuf,
    pub db_path: PathBuf,
    pub log_path: PathBuf,
    pub reload_state_path: PathBuf,
}

impl Paths {
    pub fn resolve() -> Result<Self, LifecycleError> {
        let state_dir = crate::env::state_dir()?;
        let config_path = crate::env::config_path()?;
        Ok(Self {
            socket_path: crate::env::socket_path(&state_dir),
            pid_path: crate::env::pid_path(&state_dir),
            version_path: crate::env::version_path(&state_dir),
            db_path: crate::env::db_path(&state_dir),
            log_path: crate::env::log_path(&state_dir),
            reload_state_path: crate::env::reload_state_path(&state_dir),
            state_dir,
            config_path,
        })
    }
}

/// The ids this build stamps into its version file and `VERSION`
/// replies; bumped on every reload so a stale reconnecting client can
/// tell its peer restarted.
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a listener connection or background task needs. One
/// instance, built at startup, shared behind `Arc`.
pub struct DaemonState {
    pub paths: Paths,
    pub config: overseer_config::Config,
    pub store: Arc<Store>,
    pub sensors: Arc<SensorMap>,
    pub context: Mutex<ContextManager<SystemClock>>,
    pub tunnels: Arc<TunnelRegistry>,
    pub companions: Arc<CompanionRegistry>,
    pub notify: Arc<dyn overseer_adapters::NotifyAdapter>,
    pub clock: SystemClock,
    pub id_gen: NanoIdGen,
    pub start_time: Instant,
    pub daemon_exe: String,
    pub keyring: Arc<dyn overseer_adapters::KeyringProvider>,
    pub shutdown: CancellationToken,
}

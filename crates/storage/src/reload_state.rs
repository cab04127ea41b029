//! The reload-state snapshot written before a daemon exits and read by
//! its successor to adopt still-running tunnels without respawning
//! them (`spec.md` §4.E "Adoption on reload").

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub alias: String,
    pub pid: u32,
    pub state: String,
    pub token: String,
    pub start_time_epoch_ms: u64,
    pub last_connected_epoch_ms: Option<u64>,
    pub retry_count: u32,
    pub total_reconnects: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadState {
    pub written_at_epoch_ms: u64,
    pub tunnels: Vec<TunnelSnapshot>,
}

impl ReloadState {
    pub fn new(tunnels: Vec<TunnelSnapshot>) -> Self {
        let written_at_epoch_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        Self { written_at_epoch_ms, tunnels }
    }

    /// Atomically write via a temp file + rename, matching the export
    /// writer's durability story (`spec.md` §4.D).
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Option<Self>, StorageError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let body = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Whether this snapshot is young enough to trust for adoption.
    pub fn is_fresh(&self, now_epoch_ms: u64, ttl_ms: u64) -> bool {
        now_epoch_ms.saturating_sub(self.written_at_epoch_ms) <= ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> TunnelSnapshot {
        TunnelSnapshot {
            alias: "lab".into(),
            pid: 4242,
            state: "connected".into(),
            token: "tok".into(),
            start_time_epoch_ms: 1,
            last_connected_epoch_ms: Some(2),
            retry_count: 0,
            total_reconnects: 0,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reload_state.json");
        let state = ReloadState::new(vec![sample()]);
        state.write_atomic(&path).unwrap();

        let loaded = ReloadState::read(&path).unwrap().unwrap();
        assert_eq!(loaded.tunnels, vec![sample()]);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(ReloadState::read(&path).unwrap().is_none());
    }

    #[test]
    fn freshness_respects_ttl() {
        let state = ReloadState { written_at_epoch_ms: 1_000, tunnels: vec![] };
        assert!(state.is_fresh(1_500, 1_000));
        assert!(!state.is_fresh(3_000, 1_000));
    }
}

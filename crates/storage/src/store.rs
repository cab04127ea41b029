//! Append-only persistence for the three event streams the daemon
//! produces: sensor changes, tunnel events, and daemon events. Backed by
//! a WAL-mode SQLite database; the exact schema is ours to pick, not a
//! contract with anything outside this crate.

use crate::error::StorageError;
use overseer_core::Event;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::thread;
use std::time::Duration;

const BUSY_RETRY_ATTEMPTS: u32 = 3;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sensor_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    epoch_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tunnel_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alias TEXT NOT NULL,
    kind TEXT NOT NULL,
    details TEXT NOT NULL,
    epoch_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS daemon_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    details TEXT NOT NULL,
    epoch_ms INTEGER NOT NULL
);
";

/// A handle to the daemon's append-only event store.
///
/// One `Store` is opened per daemon process and shared behind an `Arc`
/// across the sensor bus, context manager, and every tunnel supervisor
/// task; the connection is mutex-guarded so that sharing is sound.
/// Methods are synchronous and briefly block the calling task — callers
/// on the async runtime that expect long-running queries should wrap
/// the call in `spawn_blocking`, but the append-only writes here are
/// fast enough in practice not to need it.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Append an `Event`, fanning it out to the table matching its kind.
    pub fn append_event(&self, event: &Event) -> Result<(), StorageError> {
        match event {
            Event::SensorChanged { sensor, old, new, epoch_ms } => {
                self.with_busy_retry(|conn| {
                    conn.execute(
                        "INSERT INTO sensor_changes (sensor, old_value, new_value, epoch_ms) VALUES (?1, ?2, ?3, ?4)",
                        params![sensor, old, new, *epoch_ms as i64],
                    )
                })
            }
            Event::TunnelEvent { alias, kind, details, epoch_ms } => {
                let kind_str = serde_json::to_value(kind)?.as_str().unwrap_or_default().to_string();
                self.with_busy_retry(|conn| {
                    conn.execute(
                        "INSERT INTO tunnel_events (alias, kind, details, epoch_ms) VALUES (?1, ?2, ?3, ?4)",
                        params![alias, kind_str, details, *epoch_ms as i64],
                    )
                })
            }
            Event::DaemonEvent { kind, details, epoch_ms } => {
                let kind_str = serde_json::to_value(kind)?.as_str().unwrap_or_default().to_string();
                self.with_busy_retry(|conn| {
                    conn.execute(
                        "INSERT INTO daemon_events (kind, details, epoch_ms) VALUES (?1, ?2, ?3)",
                        params![kind_str, details, *epoch_ms as i64],
                    )
                })
            }
        }?;
        Ok(())
    }

    /// Retry a write up to `BUSY_RETRY_ATTEMPTS` times on `SQLITE_BUSY`,
    /// sleeping `BUSY_RETRY_DELAY` between attempts. A writer contending
    /// with a long-running reader (e.g. a `CONTEXT_STATUS events` export)
    /// is the only expected source of contention in a single-process,
    /// single-writer daemon.
    fn with_busy_retry<F>(&self, mut f: F) -> Result<usize, StorageError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<usize>,
    {
        let conn = self.conn.lock();
        let mut attempt = 0;
        loop {
            match f(&conn) {
                Ok(rows) => return Ok(rows),
                Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == rusqlite::ErrorCode::DatabaseBusy => {
                    attempt += 1;
                    if attempt >= BUSY_RETRY_ATTEMPTS {
                        return Err(StorageError::Busy { attempts: attempt });
                    }
                    thread::sleep(BUSY_RETRY_DELAY);
                }
                Err(e) => return Err(StorageError::Database(e)),
            }
        }
    }

    /// Truncate the WAL file back into the main database. Called
    /// periodically and on clean shutdown.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.conn.lock().pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }

    /// Most recent `limit` context-related daemon events, oldest first.
    /// Used by `CONTEXT_STATUS events` to answer without re-deriving
    /// history from the in-memory context manager.
    pub fn recent_daemon_events(&self, limit: usize) -> Result<Vec<(String, String, u64)>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT kind, details, epoch_ms FROM daemon_events ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().rev().collect())
    }

    /// Row count across all three tables, mostly useful for tests.
    pub fn total_event_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT
                (SELECT COUNT(*) FROM sensor_changes) +
                (SELECT COUNT(*) FROM tunnel_events) +
                (SELECT COUNT(*) FROM daemon_events)",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::{DaemonEventKind, TunnelEventKind};

    #[test]
    fn appends_and_counts_events() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_event(&Event::SensorChanged { sensor: "online".into(), old: None, new: Some("true".into()), epoch_ms: 1 })
            .unwrap();
        store
            .append_event(&Event::TunnelEvent { alias: "lab".into(), kind: TunnelEventKind::Connect, details: String::new(), epoch_ms: 2 })
            .unwrap();
        store
            .append_event(&Event::DaemonEvent { kind: DaemonEventKind::Startup, details: String::new(), epoch_ms: 3 })
            .unwrap();
        assert_eq!(store.total_event_count().unwrap(), 3);
    }

    #[test]
    fn recent_daemon_events_are_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5u64 {
            store
                .append_event(&Event::DaemonEvent { kind: DaemonEventKind::ContextTransition, details: format!("t{i}"), epoch_ms: i })
                .unwrap();
        }
        let rows = store.recent_daemon_events(3).unwrap();
        let details: Vec<_> = rows.iter().map(|(_, d, _)| d.as_str()).collect();
        assert_eq!(details, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn checkpoint_does_not_error_on_memory_db() {
        let store = Store::open_in_memory().unwrap();
        store.checkpoint().unwrap();
    }
}

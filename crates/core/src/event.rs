//! Append-only event records. Persisted through storage for audit/replay
//! and also used as the in-process notification payload passed between
//! the sensor bus, rule engine, context manager and supervisors — see
//! `SPEC_FULL.md` §3 "Event enum".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelEventKind {
    Connect,
    Disconnect,
    Reconnecting,
    Adopted,
    ConnectFailed,
    RetriesExhausted,
    CompanionStarted,
    CompanionStopped,
    CompanionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonEventKind {
    Startup,
    ReloadInitiated,
    Stop,
    ExportWriteFailed,
    AskpassTokenMismatch,
    ContextTransition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SensorChanged { sensor: String, old: Option<String>, new: Option<String>, epoch_ms: u64 },
    TunnelEvent { alias: String, kind: TunnelEventKind, details: String, epoch_ms: u64 },
    DaemonEvent { kind: DaemonEventKind, details: String, epoch_ms: u64 },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SensorChanged { .. } => "sensor:changed",
            Event::TunnelEvent { .. } => "tunnel:event",
            Event::DaemonEvent { .. } => "daemon:event",
        }
    }

    pub fn epoch_ms(&self) -> u64 {
        match self {
            Event::SensorChanged { epoch_ms, .. }
            | Event::TunnelEvent { epoch_ms, .. }
            | Event::DaemonEvent { epoch_ms, .. } => *epoch_ms,
        }
    }
}

/// A transition recorded in the context manager's bounded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTransition {
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub epoch_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_matches_variant() {
        let e = Event::TunnelEvent { alias: "lab".into(), kind: TunnelEventKind::Connect, details: String::new(), epoch_ms: 0 };
        assert_eq!(e.name(), "tunnel:event");
    }
}

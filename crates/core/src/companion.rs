//! Companion process state: per `(tunnel_alias, companion_name)`.

use crate::ring::LineRing;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompanionLifecycleState {
    Starting,
    Running,
    Ready,
    Waiting,
    Stopped,
    Exited,
    Failed,
}

/// One timestamped, tagged output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionOutputLine {
    pub epoch_ms: u64,
    pub text: String,
}

pub struct CompanionState {
    pub tunnel_alias: String,
    pub name: String,
    pub state: CompanionLifecycleState,
    pub pid: Option<u32>,
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub exit_error: Option<String>,
    pub output_ring: LineRing<CompanionOutputLine>,
    /// Attach session ids currently fanned out to (see engine's attach
    /// registry for the actual stream handles).
    pub attach_sessions: Vec<String>,
    /// Token handed to the current `companion-run` child, checked
    /// against `COMPANION_INIT`'s token argument. Mirrors
    /// `TunnelState::auth_token`'s role in the askpass handshake.
    pub current_token: Option<String>,
}

impl CompanionState {
    pub fn new(tunnel_alias: impl Into<String>, name: impl Into<String>, command: Vec<String>, ring_capacity: usize) -> Self {
        Self {
            tunnel_alias: tunnel_alias.into(),
            name: name.into(),
            state: CompanionLifecycleState::Starting,
            pid: None,
            command,
            exit_code: None,
            exit_error: None,
            output_ring: LineRing::new(ring_capacity),
            attach_sessions: Vec::new(),
            current_token: None,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.tunnel_alias.clone(), self.name.clone())
    }
}

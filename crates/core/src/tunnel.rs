//! Tunnel descriptors (static, from configuration) and tunnel state
//! (mutable, owned by the supervisor).

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionDescriptor {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub alias: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub companions: Vec<CompanionDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelDesired {
    Connected,
    Disconnected,
}

/// The tunnel state machine's discrete states (see `spec.md` §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelLifecycleState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Reconnecting,
}

impl TunnelLifecycleState {
    /// States in which a live child process is expected to exist.
    pub fn expects_pid(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
    }
}

/// Mutable per-tunnel state. One instance per alias that has ever been
/// touched; invariants are upheld by the transition methods, never by
/// direct field mutation from outside this module.
#[derive(Debug, Clone)]
pub struct TunnelState {
    pub alias: String,
    pub desired: TunnelDesired,
    pub state: TunnelLifecycleState,
    pub pid: Option<u32>,
    pub start_time: Option<Instant>,
    pub last_connected_time: Option<Instant>,
    pub disconnected_time: Option<Instant>,
    pub retry_count: u32,
    pub next_retry_at: Option<Instant>,
    pub total_reconnects: u64,
    pub tags_in_effect: Vec<String>,
    pub env_overlay_in_effect: BTreeMap<String, String>,
    pub auth_token: String,
    /// True while this tunnel's child is alive but we've already decided
    /// to reconnect (awaiting the exit of the old child before spawning
    /// the new one). Part of `Reconnecting`'s "waiting-for-child-death"
    /// sub-case in `spec.md` §3.
    pub awaiting_child_exit: bool,
}

impl TunnelState {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            desired: TunnelDesired::Disconnected,
            state: TunnelLifecycleState::Disconnected,
            pid: None,
            start_time: None,
            last_connected_time: None,
            disconnected_time: None,
            retry_count: 0,
            next_retry_at: None,
            total_reconnects: 0,
            tags_in_effect: Vec::new(),
            env_overlay_in_effect: BTreeMap::new(),
            auth_token: String::new(),
            awaiting_child_exit: false,
        }
    }

    /// `connecting → connected`. Resets the retry counter and records
    /// timestamps per the invariants in `spec.md` §3.
    pub fn mark_connected(&mut self, now: Instant) {
        self.state = TunnelLifecycleState::Connected;
        self.last_connected_time = Some(now);
        self.retry_count = 0;
        self.disconnected_time = None;
        debug_assert!(self.last_connected_time.unwrap() >= self.start_time.unwrap_or(now));
    }

    /// `disconnected|reconnecting → connecting`, spawning a fresh child.
    pub fn mark_connecting(&mut self, pid: u32, token: String, now: Instant) {
        self.state = TunnelLifecycleState::Connecting;
        self.pid = Some(pid);
        self.start_time = Some(now);
        self.auth_token = token;
        self.awaiting_child_exit = false;
    }

    /// `connected|connecting → reconnecting`, child death observed or
    /// spawn failed before readiness, and retries remain.
    pub fn mark_reconnecting(&mut self, backoff: std::time::Duration, now: Instant) {
        self.state = TunnelLifecycleState::Reconnecting;
        self.pid = None;
        self.disconnected_time = Some(now);
        self.retry_count += 1;
        self.total_reconnects += 1;
        self.next_retry_at = Some(now + backoff);
        self.awaiting_child_exit = false;
    }

    /// `* → disconnected`, retries exhausted or explicit disconnect
    /// completed.
    pub fn mark_disconnected(&mut self, now: Instant) {
        self.state = TunnelLifecycleState::Disconnected;
        self.pid = None;
        self.disconnected_time = Some(now);
        self.next_retry_at = None;
        self.awaiting_child_exit = false;
    }

    /// `connected|connecting|reconnecting → disconnecting`, signals sent,
    /// awaiting child exit.
    pub fn mark_disconnecting(&mut self) {
        self.state = TunnelLifecycleState::Disconnecting;
    }

    /// `Connect(alias)`: idempotent per `spec.md` §4.E.
    pub fn request_connect(&mut self, tags: Vec<String>, overlay: BTreeMap<String, String>) {
        self.desired = TunnelDesired::Connected;
        self.tags_in_effect = tags;
        self.env_overlay_in_effect = overlay;
        if self.state == TunnelLifecycleState::Reconnecting {
            self.retry_count = 0;
            self.next_retry_at = None;
        }
    }

    /// `Disconnect(alias)`: idempotent.
    pub fn request_disconnect(&mut self) {
        self.desired = TunnelDesired::Disconnected;
        self.next_retry_at = None;
    }

    /// `Reset`: only affects tunnels currently `reconnecting`.
    pub fn reset_backoff(&mut self) {
        if self.state == TunnelLifecycleState::Reconnecting {
            self.retry_count = 0;
            self.next_retry_at = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == TunnelLifecycleState::Connected
    }

    /// Checked invariant: `pid` is `Some` iff the state expects one, or
    /// we're mid-reconnect still holding the old child.
    pub fn pid_invariant_holds(&self) -> bool {
        if self.awaiting_child_exit {
            return self.pid.is_some();
        }
        self.pid.is_some() == self.state.expects_pid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_then_connected_resets_retry_count() {
        let mut t = TunnelState::new("lab");
        let now = Instant::now();
        t.mark_connecting(100, "tok1".into(), now);
        t.mark_reconnecting(std::time::Duration::from_secs(1), now);
        assert_eq!(t.retry_count, 1);
        t.mark_connecting(101, "tok2".into(), now);
        t.mark_connected(now);
        assert_eq!(t.retry_count, 0);
        assert!(t.last_connected_time.unwrap() >= t.start_time.unwrap());
    }

    #[test]
    fn connect_is_idempotent_on_already_connecting() {
        let mut t = TunnelState::new("lab");
        t.request_connect(vec![], Default::default());
        assert_eq!(t.desired, TunnelDesired::Connected);
        t.request_connect(vec![], Default::default());
        assert_eq!(t.desired, TunnelDesired::Connected);
    }

    #[test]
    fn connect_resets_retry_counter_when_reconnecting() {
        let mut t = TunnelState::new("lab");
        let now = Instant::now();
        t.mark_connecting(1, "t".into(), now);
        t.mark_reconnecting(std::time::Duration::from_secs(1), now);
        assert_eq!(t.retry_count, 1);
        t.request_connect(vec![], Default::default());
        assert_eq!(t.retry_count, 0);
        assert!(t.next_retry_at.is_none());
    }

    #[test]
    fn pid_invariant_across_lifecycle() {
        let mut t = TunnelState::new("lab");
        let now = Instant::now();
        assert!(t.pid_invariant_holds());
        t.mark_connecting(5, "t".into(), now);
        assert!(t.pid_invariant_holds());
        t.mark_connected(now);
        assert!(t.pid_invariant_holds());
        t.mark_reconnecting(std::time::Duration::from_secs(1), now);
        assert!(t.pid_invariant_holds());
        t.mark_disconnected(now);
        assert!(t.pid_invariant_holds());
    }
}

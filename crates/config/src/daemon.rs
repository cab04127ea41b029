//! Daemon-wide settings: ssh invocation flags, backoff schedule,
//! hysteresis windows, and the bounded buffers/exports the runtime
//! sizes itself by.

use crate::duration::ConfigDuration;
use overseer_core::PreferredIpVersion;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_keepalive_interval() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(15))
}

fn default_keepalive_count() -> u32 {
    3
}

fn default_initial_backoff() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(1))
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_backoff() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(300))
}

fn default_max_retries() -> u32 {
    0
}

fn default_ring_capacity() -> usize {
    1000
}

fn default_context_history_len() -> usize {
    100
}

fn default_ipv4_hysteresis() -> u32 {
    2
}

fn default_ipv6_hysteresis() -> u32 {
    4
}

fn default_tcp_stale_threshold() -> ConfigDuration {
    ConfigDuration(Duration::ZERO)
}

fn default_sleep_wake_grace() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(3))
}

fn default_reload_state_ttl() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(30))
}

/// SSH invocation and reconnect-backoff settings shared by every tunnel
/// unless a tunnel-level override narrows them (no per-tunnel overrides
/// are currently parsed; the daemon applies one schedule uniformly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_keepalive_interval")]
    pub ssh_keepalive_interval: ConfigDuration,

    #[serde(default = "default_keepalive_count")]
    pub ssh_keepalive_count: u32,

    /// Additional `-o Key=Value` pairs appended after the built-in
    /// keepalive and batch-mode overrides.
    #[serde(default)]
    pub ssh_extra_options: Vec<(String, String)>,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: ConfigDuration,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: ConfigDuration,

    /// 0 means retry forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_ring_capacity")]
    pub companion_ring_capacity: usize,

    #[serde(default = "default_context_history_len")]
    pub context_history_len: usize,

    #[serde(default = "default_ipv4_hysteresis")]
    pub ipv4_hysteresis_count: u32,

    #[serde(default = "default_ipv6_hysteresis")]
    pub ipv6_hysteresis_count: u32,

    #[serde(default = "default_tcp_stale_threshold")]
    pub tcp_stale_threshold: ConfigDuration,

    #[serde(default = "default_sleep_wake_grace")]
    pub sleep_wake_grace: ConfigDuration,

    #[serde(default = "default_reload_state_ttl")]
    pub reload_state_ttl: ConfigDuration,

    #[serde(default)]
    pub preferred_ip_version: PreferredIpVersion,

    #[serde(default)]
    pub notifications_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ssh_keepalive_interval: default_keepalive_interval(),
            ssh_keepalive_count: default_keepalive_count(),
            ssh_extra_options: Vec::new(),
            initial_backoff: default_initial_backoff(),
            backoff_factor: default_backoff_factor(),
            max_backoff: default_max_backoff(),
            max_retries: default_max_retries(),
            companion_ring_capacity: default_ring_capacity(),
            context_history_len: default_context_history_len(),
            ipv4_hysteresis_count: default_ipv4_hysteresis(),
            ipv6_hysteresis_count: default_ipv6_hysteresis(),
            tcp_stale_threshold: default_tcp_stale_threshold(),
            sleep_wake_grace: default_sleep_wake_grace(),
            reload_state_ttl: default_reload_state_ttl(),
            preferred_ip_version: PreferredIpVersion::default(),
            notifications_enabled: false,
        }
    }
}

fn default_probe_interval() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(10))
}

fn default_probe_timeout() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(3))
}

/// Per-sensor probe target lists and timing. `tcp_targets` are
/// `host:port` pairs checked in order until one connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub tcp_targets: Vec<String>,

    #[serde(default)]
    pub public_ip_dns_resolvers: Vec<String>,

    #[serde(default)]
    pub public_ip_http_urls: Vec<String>,

    #[serde(default = "default_probe_interval")]
    pub interval: ConfigDuration,

    #[serde(default = "default_probe_timeout")]
    pub timeout: ConfigDuration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tcp_targets: Vec::new(),
            public_ip_dns_resolvers: Vec::new(),
            public_ip_http_urls: Vec::new(),
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_daemon_config_matches_canonical_hysteresis() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.ipv4_hysteresis_count, 2);
        assert_eq!(cfg.ipv6_hysteresis_count, 4);
        assert_eq!(cfg.tcp_stale_threshold.as_duration(), Duration::ZERO);
    }

    #[test]
    fn deserializes_from_partial_map() {
        let json = serde_json::json!({ "ssh_keepalive_interval": "30s" });
        let cfg: DaemonConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.ssh_keepalive_interval.as_duration(), Duration::from_secs(30));
        assert_eq!(cfg.ssh_keepalive_count, default_keepalive_count());
    }
}

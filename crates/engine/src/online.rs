//! Online policy (spec.md §4.B): a pluggable pure function over the
//! readings snapshot. `TcpPriorityPolicy` is the default.

use overseer_core::sensor::is_offline_or_link_local;
use overseer_core::{sensor_names, SensorReading};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pure decision function: given the current readings, is the host
/// online? Implementations must be deterministic and side-effect free.
pub trait OnlinePolicy: Send + Sync + 'static {
    fn is_online(&self, readings: &HashMap<String, SensorReading>, now: Instant) -> bool;
}

/// `tcp.online` wins whenever it is present and fresher than
/// `stale_threshold`; otherwise falls back to the public IP sensors.
pub struct TcpPriorityPolicy {
    pub stale_threshold: Duration,
}

impl TcpPriorityPolicy {
    pub fn new(stale_threshold: Duration) -> Self {
        Self { stale_threshold }
    }
}

impl OnlinePolicy for TcpPriorityPolicy {
    fn is_online(&self, readings: &HashMap<String, SensorReading>, now: Instant) -> bool {
        if let Some(tcp) = readings.get(sensor_names::TCP) {
            if let Some(online) = tcp.online {
                if now.saturating_duration_since(tcp.timestamp) <= self.stale_threshold {
                    return online;
                }
            }
        }
        if is_usable_ip(readings.get(sensor_names::PUBLIC_IPV4)) {
            return true;
        }
        if is_usable_ip(readings.get(sensor_names::PUBLIC_IPV6)) {
            return true;
        }
        false
    }
}

fn is_usable_ip(reading: Option<&SensorReading>) -> bool {
    match reading.and_then(|r| r.ip) {
        Some(ip) => !is_offline_or_link_local(ip),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::OFFLINE_SENTINEL_V4;
    use std::net::IpAddr;

    fn reading(sensor: &str, online: Option<bool>, ip: Option<IpAddr>, ts: Instant) -> SensorReading {
        let mut r = SensorReading::online(sensor, online.unwrap_or(false), ts);
        r.online = online;
        r.ip = ip;
        r
    }

    #[test]
    fn tcp_priority_wins_when_fresh() {
        let t0 = Instant::now();
        let mut readings = HashMap::new();
        readings.insert(sensor_names::TCP.to_string(), reading(sensor_names::TCP, Some(true), None, t0));
        readings.insert(
            sensor_names::PUBLIC_IPV4.to_string(),
            reading(sensor_names::PUBLIC_IPV4, None, Some(IpAddr::V4(OFFLINE_SENTINEL_V4)), t0),
        );
        let policy = TcpPriorityPolicy::new(Duration::ZERO);
        assert!(policy.is_online(&readings, t0));
    }

    #[test]
    fn falls_back_to_public_ipv4_without_tcp() {
        let t0 = Instant::now();
        let mut readings = HashMap::new();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        readings.insert(sensor_names::PUBLIC_IPV4.to_string(), reading(sensor_names::PUBLIC_IPV4, None, Some(ip), t0));
        let policy = TcpPriorityPolicy::new(Duration::ZERO);
        assert!(policy.is_online(&readings, t0));
    }

    #[test]
    fn offline_sentinel_is_not_usable_evidence() {
        let t0 = Instant::now();
        let mut readings = HashMap::new();
        readings.insert(
            sensor_names::PUBLIC_IPV4.to_string(),
            reading(sensor_names::PUBLIC_IPV4, None, Some(IpAddr::V4(OFFLINE_SENTINEL_V4)), t0),
        );
        let policy = TcpPriorityPolicy::new(Duration::ZERO);
        assert!(!policy.is_online(&readings, t0));
    }
}

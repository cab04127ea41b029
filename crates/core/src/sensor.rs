//! Sensor readings and identity.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

/// The canonical IPv4 "no connectivity" marker every probe writes when it
/// cannot determine a real address.
pub const OFFLINE_SENTINEL_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 0);

/// The canonical IPv6 "no connectivity" marker.
pub const OFFLINE_SENTINEL_V6: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0);

/// Well-known sensor names.
pub mod names {
    pub const TCP: &str = "tcp";
    pub const PUBLIC_IPV4: &str = "public_ipv4";
    pub const PUBLIC_IPV6: &str = "public_ipv6";
    pub const LOCAL_IPV4: &str = "local_ipv4";
    pub const LOCAL_IPV6: &str = "local_ipv6";
    pub const ONLINE: &str = "online";
    pub const CONTEXT: &str = "context";
    pub const LOCATION: &str = "location";
    pub const SYSTEM_POWER: &str = "system_power";

    /// Name of the dynamic sensor for an environment variable.
    pub fn env(var: &str) -> String {
        format!("env:{var}")
    }
}

/// A single immutable measurement. The bus keeps only the most recent
/// reading per sensor name.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub sensor: String,
    pub timestamp: Instant,
    pub online: Option<bool>,
    pub ip: Option<IpAddr>,
    pub value: Option<String>,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

impl SensorReading {
    fn empty(sensor: impl Into<String>, timestamp: Instant) -> Self {
        Self {
            sensor: sensor.into(),
            timestamp,
            online: None,
            ip: None,
            value: None,
            latency: None,
            error: None,
        }
    }

    pub fn online(sensor: impl Into<String>, online: bool, timestamp: Instant) -> Self {
        Self { online: Some(online), ..Self::empty(sensor, timestamp) }
    }

    pub fn ip(sensor: impl Into<String>, ip: IpAddr, timestamp: Instant) -> Self {
        Self { ip: Some(ip), ..Self::empty(sensor, timestamp) }
    }

    pub fn ip_with_latency(
        sensor: impl Into<String>,
        ip: IpAddr,
        latency: Duration,
        timestamp: Instant,
    ) -> Self {
        Self { ip: Some(ip), latency: Some(latency), ..Self::empty(sensor, timestamp) }
    }

    pub fn text(sensor: impl Into<String>, value: impl Into<String>, timestamp: Instant) -> Self {
        Self { value: Some(value.into()), ..Self::empty(sensor, timestamp) }
    }

    pub fn error(sensor: impl Into<String>, error: impl Into<String>, timestamp: Instant) -> Self {
        Self { error: Some(error.into()), ..Self::empty(sensor, timestamp) }
    }

    /// True when this reading carries no new information (a probe error).
    pub fn is_error(&self) -> bool {
        self.error.is_some() && self.online.is_none() && self.ip.is_none() && self.value.is_none()
    }

    /// Type-specific equality used by the bus to decide whether a reading
    /// is a *change*: boolean direct, string equal, IP equal after
    /// normalization. The timestamp and any carried error are ignored.
    pub fn value_eq(&self, other: &SensorReading) -> bool {
        self.online == other.online
            && self.value == other.value
            && normalize_ip(self.ip) == normalize_ip(other.ip)
    }

    /// Whether this reading's IP equals the distinguished offline sentinel
    /// for its address family.
    pub fn is_offline_sentinel(&self) -> bool {
        match self.ip {
            Some(IpAddr::V4(v4)) => v4 == OFFLINE_SENTINEL_V4,
            Some(IpAddr::V6(v6)) => is_link_local_v6(v6),
            None => false,
        }
    }
}

fn is_link_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Normalize an IPv6 address to its /64 prefix (zeroing the interface
/// identifier) so privacy-extension rotation does not look like a change.
/// IPv4 addresses pass through unchanged.
pub fn normalize_ip(ip: Option<IpAddr>) -> Option<IpAddr> {
    match ip {
        Some(IpAddr::V6(v6)) => {
            let mut segments = v6.segments();
            for s in &mut segments[4..] {
                *s = 0;
            }
            Some(IpAddr::V6(Ipv6Addr::from(segments)))
        }
        other => other,
    }
}

/// Whether an IP is unsuitable as evidence of connectivity: either the
/// offline sentinel for its family, or link-local.
pub fn is_offline_or_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == OFFLINE_SENTINEL_V4 || v4.is_link_local(),
        IpAddr::V6(v6) => is_link_local_v6(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_normalizes_to_64_prefix() {
        let a: IpAddr = "2001:db8::1:2:3:4".parse().unwrap();
        let b: IpAddr = "2001:db8::aaaa:bbbb:cccc:dddd".parse().unwrap();
        assert_eq!(normalize_ip(Some(a)), normalize_ip(Some(b)));
    }

    #[test]
    fn ipv4_unaffected_by_normalization() {
        let a: IpAddr = "198.51.100.7".parse().unwrap();
        assert_eq!(normalize_ip(Some(a)), Some(a));
    }

    #[test]
    fn value_eq_ignores_timestamp_and_error() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let a = SensorReading::online("tcp", true, t0);
        let mut b = SensorReading::online("tcp", true, t1);
        b.error = Some("transient".into());
        assert!(a.value_eq(&b));
    }

    #[test]
    fn offline_sentinel_v4_detected() {
        let r = SensorReading::ip("public_ipv4", IpAddr::V4(OFFLINE_SENTINEL_V4), Instant::now());
        assert!(r.is_offline_sentinel());
    }
}

//! Condition trees: the pure predicate language rules and locations are
//! built from.

use crate::sensor::{is_offline_or_link_local, names};
use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A readings snapshot plus the computed `online` flag, as seen by a
/// condition evaluation. Implemented by the sensor bus's snapshot type;
/// kept as a trait so tests can supply a bare `HashMap`.
pub trait ReadingsView {
    /// String representation of a sensor's current value, if any:
    /// the `value` field for text sensors, or the IP rendered as text for
    /// IP sensors.
    fn string_value(&self, sensor: &str) -> Option<String>;
    /// The sensor's boolean reading, if any.
    fn bool_value(&self, sensor: &str) -> Option<bool>;
}

impl ReadingsView for HashMap<String, crate::sensor::SensorReading> {
    fn string_value(&self, sensor: &str) -> Option<String> {
        let r = self.get(sensor)?;
        if let Some(ip) = r.ip {
            Some(ip.to_string())
        } else {
            r.value.clone()
        }
    }

    fn bool_value(&self, sensor: &str) -> Option<bool> {
        self.get(sensor).and_then(|r| r.online)
    }
}

/// A match pattern for a string-sensor leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
    Exact(String),
    Cidr(CidrPattern),
    Glob(String),
}

impl Pattern {
    /// Parse a pattern string the way the config layer would: `/` implies
    /// CIDR, `*` implies glob, otherwise exact.
    pub fn parse(s: &str) -> Self {
        if let Some(cidr) = CidrPattern::parse(s) {
            Pattern::Cidr(cidr)
        } else if s.contains('*') {
            Pattern::Glob(s.to_string())
        } else {
            Pattern::Exact(s.to_string())
        }
    }

    fn matches(&self, value: &str) -> bool {
        if value.is_empty() {
            // Empty string never matches a glob; exact/CIDR handle emptiness
            // via their own parse failure paths.
            if matches!(self, Pattern::Glob(_)) {
                return false;
            }
        }
        match self {
            Pattern::Exact(expected) => expected == value,
            Pattern::Cidr(cidr) => value.parse::<IpAddr>().map(|ip| cidr.contains(ip)).unwrap_or(false),
            Pattern::Glob(pattern) => glob_match(pattern, value),
        }
    }
}

/// A CIDR network (`ip/prefix`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrPattern {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrPattern {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let network: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return None;
        }
        Some(Self { network, prefix_len })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len)
    }
}

/// Minimal `*`-wildcard glob matcher (no `?`, no character classes —
/// all that `spec.md`'s pattern grammar requires).
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            if !rest.ends_with(part) {
                return false;
            }
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

/// Sum type for conditions over a readings snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Sensor { sensor: String, pattern: Pattern },
    Bool { sensor: String, expected: bool },
    All { children: Vec<Condition> },
    Any { children: Vec<Condition> },
}

/// Network-derived sensors whose cached readings cannot be trusted when
/// `online` is false.
fn is_network_derived(sensor: &str) -> bool {
    matches!(sensor, names::PUBLIC_IPV4 | names::PUBLIC_IPV6 | names::LOCAL_IPV4 | names::LOCAL_IPV6)
}

impl Condition {
    /// Evaluate the condition tree against a readings snapshot plus the
    /// computed `online` flag. Pure and total: leaf errors (missing
    /// readings) simply evaluate to `false`.
    pub fn evaluate(&self, readings: &impl ReadingsView, online: bool) -> bool {
        match self {
            Condition::Sensor { sensor, pattern } => {
                if !online && is_network_derived(sensor) {
                    return false;
                }
                match readings.string_value(sensor) {
                    Some(v) => {
                        if is_network_derived(sensor) {
                            if let Ok(ip) = v.parse::<IpAddr>() {
                                if is_offline_or_link_local(ip) {
                                    return false;
                                }
                            }
                        }
                        pattern.matches(&v)
                    }
                    None => false,
                }
            }
            Condition::Bool { sensor, expected } => readings.bool_value(sensor) == Some(*expected),
            Condition::All { children } => children.iter().all(|c| c.evaluate(readings, online)),
            Condition::Any { children } => children.iter().any(|c| c.evaluate(readings, online)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorReading;
    use std::time::Instant;

    fn readings(pairs: &[(&str, SensorReading)]) -> HashMap<String, SensorReading> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn all_vacuously_true() {
        let c = Condition::All { children: vec![] };
        assert!(c.evaluate(&HashMap::new(), true));
    }

    #[test]
    fn any_vacuously_false() {
        let c = Condition::Any { children: vec![] };
        assert!(!c.evaluate(&HashMap::new(), true));
    }

    #[test]
    fn cidr_match() {
        let r = readings(&[("public_ipv4", SensorReading::ip("public_ipv4", "198.51.100.7".parse().unwrap(), Instant::now()))]);
        let c = Condition::Sensor { sensor: "public_ipv4".into(), pattern: Pattern::parse("198.51.100.0/24") };
        assert!(c.evaluate(&r, true));
    }

    #[test]
    fn network_leaf_false_when_offline_even_if_cached() {
        let r = readings(&[("public_ipv4", SensorReading::ip("public_ipv4", "198.51.100.7".parse().unwrap(), Instant::now()))]);
        let c = Condition::Sensor { sensor: "public_ipv4".into(), pattern: Pattern::parse("198.51.100.0/24") };
        assert!(!c.evaluate(&r, false));
    }

    #[test]
    fn glob_empty_string_never_matches() {
        let r = readings(&[("env:FOO", SensorReading::text("env:FOO", "", Instant::now()))]);
        let c = Condition::Sensor { sensor: "env:FOO".into(), pattern: Pattern::parse("*") };
        assert!(!c.evaluate(&r, true));
    }

    #[test]
    fn glob_matches_prefix_and_suffix() {
        assert!(glob_match("office-*", "office-wifi"));
        assert!(glob_match("*-wifi", "office-wifi"));
        assert!(!glob_match("office-*", "home-wifi"));
    }

    #[test]
    fn bool_leaf() {
        let r = readings(&[("online", SensorReading::online("online", true, Instant::now()))]);
        let c = Condition::Bool { sensor: "online".into(), expected: true };
        assert!(c.evaluate(&r, true));
    }
}

//! Public IP probes. Two-stage consensus: parallel HTTPS "what's my IP"
//! services first, then a DNS fallback against direct resolver IPs when
//! every HTTP service fails. The DNS path applies hysteresis so a
//! transiently different answer does not immediately flip the sensor;
//! the HTTP path is authoritative and bypasses it.

use super::Probe;
use async_trait::async_trait;
use overseer_core::sensor::{is_offline_or_link_local, normalize_ip, OFFLINE_SENTINEL_V4, OFFLINE_SENTINEL_V6};
use overseer_core::{sensor_names, Clock, SensorReading};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const HTTP_PER_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_AGGREGATE_TIMEOUT: Duration = Duration::from_secs(6);
const DNS_AGGREGATE_TIMEOUT: Duration = Duration::from_secs(6);
const RESPONSE_CAP_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn matches(self, ip: IpAddr) -> bool {
        matches!((self, ip), (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)))
    }

    fn sentinel(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(OFFLINE_SENTINEL_V4),
            Family::V6 => IpAddr::V6(OFFLINE_SENTINEL_V6),
        }
    }

    fn sensor_name(self) -> &'static str {
        match self {
            Family::V4 => sensor_names::PUBLIC_IPV4,
            Family::V6 => sensor_names::PUBLIC_IPV6,
        }
    }
}

/// Picks the value seen by at least `min_agree` sources; falls back to
/// the plurality winner. Returns `None` only when `answers` is empty.
pub fn consensus(answers: &[IpAddr], min_agree: usize) -> Option<IpAddr> {
    if answers.is_empty() {
        return None;
    }
    let mut counts: Vec<(IpAddr, usize)> = Vec::new();
    for &ip in answers {
        match counts.iter_mut().find(|(v, _)| *v == ip) {
            Some((_, n)) => *n += 1,
            None => counts.push((ip, 1)),
        }
    }
    if let Some((ip, _)) = counts.iter().find(|(_, n)| *n >= min_agree) {
        return Some(*ip);
    }
    counts.into_iter().max_by_key(|(_, n)| *n).map(|(ip, _)| ip)
}

/// Tracks N-consecutive-identical-readings hysteresis for the DNS
/// fallback path. A new candidate only becomes the stable value after
/// `threshold` consecutive observations of the same value.
pub struct Hysteresis {
    state: Mutex<HysteresisState>,
    threshold: u32,
}

struct HysteresisState {
    stable: Option<IpAddr>,
    pending: Option<IpAddr>,
    streak: u32,
}

impl Hysteresis {
    pub fn new(threshold: u32) -> Self {
        Self { state: Mutex::new(HysteresisState { stable: None, pending: None, streak: 0 }), threshold: threshold.max(1) }
    }

    /// Feed one observation, returning the (possibly updated) stable value.
    pub fn observe(&self, candidate: IpAddr) -> IpAddr {
        let mut s = self.state.lock();
        if s.stable == Some(candidate) {
            s.pending = None;
            s.streak = 0;
            return candidate;
        }
        if s.pending == Some(candidate) {
            s.streak += 1;
        } else {
            s.pending = Some(candidate);
            s.streak = 1;
        }
        if s.streak >= self.threshold {
            s.stable = Some(candidate);
            s.pending = None;
            s.streak = 0;
        }
        s.stable.unwrap_or(candidate)
    }
}

pub struct PublicIpProbe<C: Clock> {
    family: Family,
    http_urls: Vec<String>,
    dns_resolvers: Vec<String>,
    hysteresis: Hysteresis,
    clock: C,
}

impl<C: Clock> PublicIpProbe<C> {
    pub fn new(family: Family, http_urls: Vec<String>, dns_resolvers: Vec<String>, hysteresis_threshold: u32, clock: C) -> Self {
        Self { family, http_urls, dns_resolvers, hysteresis: Hysteresis::new(hysteresis_threshold), clock }
    }
}

#[async_trait]
impl<C: Clock> Probe for PublicIpProbe<C> {
    fn name(&self) -> &str {
        self.family.sensor_name()
    }

    async fn check(&self) -> SensorReading {
        let normalized = match self.resolve().await {
            Some(ip) => normalize_ip(Some(ip)).unwrap_or(ip),
            None => self.family.sentinel(),
        };
        SensorReading::ip(self.family.sensor_name(), normalized, self.clock.now())
    }
}

impl<C: Clock> PublicIpProbe<C> {
    async fn resolve(&self) -> Option<IpAddr> {
        if let Some(ip) = self.query_http().await {
            return Some(ip);
        }
        let dns_ip = self.query_dns().await?;
        Some(self.hysteresis.observe(dns_ip))
    }

    async fn query_http(&self) -> Option<IpAddr> {
        if self.http_urls.is_empty() {
            return None;
        }
        let family = self.family;
        let fetches = self.http_urls.iter().map(|url| fetch_one(url.clone(), family));
        let answers = tokio::time::timeout(HTTP_AGGREGATE_TIMEOUT, futures_util::future::join_all(fetches)).await.ok()?;
        let answers: Vec<IpAddr> = answers.into_iter().flatten().filter(|ip| family.matches(*ip)).collect();
        let min_agree = if answers.len() >= 2 { 2 } else { 1 };
        consensus(&answers, min_agree)
    }

    async fn query_dns(&self) -> Option<IpAddr> {
        if self.dns_resolvers.is_empty() {
            return None;
        }
        let family = self.family;
        let lookups = self.dns_resolvers.iter().map(|host| resolve_one(host.clone(), family));
        let answers = tokio::time::timeout(DNS_AGGREGATE_TIMEOUT, futures_util::future::join_all(lookups)).await.ok()?;
        let answers: Vec<IpAddr> = answers.into_iter().flatten().filter(|ip| family.matches(*ip)).collect();
        let min_agree = if answers.len() >= 2 { 2 } else { 1 };
        consensus(&answers, min_agree)
    }
}

async fn fetch_one(url: String, family: Family) -> Option<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_PER_SERVICE_TIMEOUT)
        .local_address(local_bind_address(family))
        .build()
        .ok()?;
    let resp = client.get(&url).send().await.ok()?;
    let bytes = resp.bytes().await.ok()?;
    let capped = &bytes[..bytes.len().min(RESPONSE_CAP_BYTES)];
    let text = std::str::from_utf8(capped).ok()?.trim();
    let ip: IpAddr = text.parse().ok()?;
    family.matches(ip).then_some(ip)
}

async fn resolve_one(host: String, family: Family) -> Option<IpAddr> {
    let addrs = tokio::net::lookup_host((host.as_str(), 0)).await.ok()?;
    addrs.map(|a: SocketAddr| a.ip()).find(|ip| family.matches(*ip))
}

fn local_bind_address(family: Family) -> Option<IpAddr> {
    match family {
        Family::V4 => Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        Family::V6 => Some(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn consensus_picks_value_seen_by_at_least_two() {
        let answers = vec![ip("1.1.1.1"), ip("1.1.1.1"), ip("2.2.2.2")];
        assert_eq!(consensus(&answers, 2), Some(ip("1.1.1.1")));
    }

    #[test]
    fn consensus_falls_back_to_plurality_without_agreement() {
        let answers = vec![ip("1.1.1.1"), ip("1.1.1.1"), ip("2.2.2.2"), ip("3.3.3.3")];
        assert_eq!(consensus(&answers, 3), Some(ip("1.1.1.1")));
    }

    #[test]
    fn consensus_is_none_for_empty_input() {
        assert_eq!(consensus(&[], 2), None);
    }

    #[test]
    fn hysteresis_requires_n_consecutive_readings_before_flipping() {
        let h = Hysteresis::new(2);
        assert_eq!(h.observe(ip("1.1.1.1")), ip("1.1.1.1"));
        assert_eq!(h.observe(ip("2.2.2.2")), ip("1.1.1.1"));
        assert_eq!(h.observe(ip("2.2.2.2")), ip("2.2.2.2"));
    }

    #[test]
    fn hysteresis_resets_streak_on_a_third_distinct_value() {
        let h = Hysteresis::new(2);
        h.observe(ip("1.1.1.1"));
        h.observe(ip("2.2.2.2"));
        assert_eq!(h.observe(ip("3.3.3.3")), ip("1.1.1.1"));
    }

    #[test]
    fn is_offline_or_link_local_recognizes_the_sentinel() {
        assert!(is_offline_or_link_local(IpAddr::V4(OFFLINE_SENTINEL_V4)));
    }
}

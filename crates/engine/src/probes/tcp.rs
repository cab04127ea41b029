//! TCP reachability probe: connects to a baked-in list of well-known
//! public hosts and reports `online=true` on the first success.

use super::Probe;
use async_trait::async_trait;
use overseer_core::{sensor_names, Clock, SensorReading};
use std::time::Duration;
use tokio::net::TcpStream;

/// Mixed IPv4/IPv6 DNS-root and major-anycast addresses, chosen so a
/// single blocked destination cannot make the probe report offline.
pub const DEFAULT_TARGETS: &[&str] = &[
    "1.1.1.1:443",
    "8.8.8.8:443",
    "9.9.9.9:443",
    "[2606:4700:4700::1111]:443",
    "[2001:4860:4860::8888]:443",
];

const OVERALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpProbe<C: Clock> {
    targets: Vec<String>,
    clock: C,
}

impl<C: Clock> TcpProbe<C> {
    pub fn new(targets: Vec<String>, clock: C) -> Self {
        let targets = if targets.is_empty() {
            DEFAULT_TARGETS.iter().map(|s| s.to_string()).collect()
        } else {
            targets
        };
        Self { targets, clock }
    }
}

#[async_trait]
impl<C: Clock> Probe for TcpProbe<C> {
    fn name(&self) -> &'static str {
        sensor_names::TCP
    }

    async fn check(&self) -> SensorReading {
        let per_host = OVERALL_TIMEOUT / self.targets.len().max(1) as u32;
        let result = tokio::time::timeout(OVERALL_TIMEOUT, probe_targets(&self.targets, per_host)).await;
        let online = matches!(result, Ok(true));
        SensorReading::online(sensor_names::TCP, online, self.clock.now())
    }
}

async fn probe_targets(targets: &[String], per_host_timeout: Duration) -> bool {
    for target in targets {
        if tokio::time::timeout(per_host_timeout, TcpStream::connect(target)).await.is_ok_and(|r| r.is_ok()) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::FakeClock;

    #[test]
    fn default_targets_used_when_config_is_empty() {
        let probe = TcpProbe::new(Vec::new(), FakeClock::new());
        assert_eq!(probe.targets.len(), DEFAULT_TARGETS.len());
    }

    #[test]
    fn configured_targets_override_defaults() {
        let probe = TcpProbe::new(vec!["10.0.0.1:1".into()], FakeClock::new());
        assert_eq!(probe.targets, vec!["10.0.0.1:1".to_string()]);
    }

    #[tokio::test]
    async fn reports_offline_when_every_target_refuses() {
        let probe = TcpProbe::new(vec!["127.0.0.1:1".into()], FakeClock::new());
        let reading = probe.check().await;
        assert_eq!(reading.online, Some(false));
    }
}

// SPDX-License-Identifier: MIT

//! Wires the configured probes into the sensor bus: constructs each
//! `Probe`, spawns its poll loop (or, for the network monitor, its own
//! coalescing loop), and starts the bus consumer task that merges
//! readings into `SensorMap`.

use overseer_config::ProbeConfig;
use overseer_core::{Clock, SensorReading};
use overseer_engine::probes::local_ip::LocalIpProbe;
use overseer_engine::probes::public_ip::{Family, PublicIpProbe};
use overseer_engine::probes::sleep_monitor::{NeverSleepSource, SleepGate};
use overseer_engine::probes::tcp::TcpProbe;
use overseer_engine::probes::{self, run_probe_loop, Probe};
use overseer_engine::SensorMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct SensorPipeline {
    pub map: Arc<SensorMap>,
    pub on_change: mpsc::UnboundedReceiver<()>,
}

/// Starts every probe task plus the bus consumer, and returns the
/// shared map and the change-notification channel the reconcile loop
/// drains.
pub fn start<C: Clock>(
    probes_config: &ProbeConfig,
    ipv4_hysteresis: u32,
    ipv6_hysteresis: u32,
    sleep_wake_grace: Duration,
    clock: C,
    store: Arc<overseer_storage::Store>,
    cancel: &CancellationToken,
) -> SensorPipeline {
    let (reading_tx, reading_rx) = mpsc::unbounded_channel::<SensorReading>();
    let map = Arc::new(SensorMap::default());
    let sleep_gate = SleepGate::new();
    let (on_change_tx, on_change_rx) = mpsc::unbounded_channel();

    let tcp_probe: Arc<dyn Probe> = Arc::new(TcpProbe::new(probes_config.tcp_targets.clone(), clock.clone()));
    tokio::spawn(run_probe_loop(tcp_probe, probes_config.interval.as_duration(), reading_tx.clone(), sleep_gate.clone(), cancel.child_token()));

    let local_v6: Arc<dyn Probe> = Arc::new(LocalIpProbe::v6(clock.clone()));
    tokio::spawn(run_probe_loop(local_v6, probes_config.interval.as_duration(), reading_tx.clone(), sleep_gate.clone(), cancel.child_token()));

    let local_v4: Arc<dyn Probe> = Arc::new(LocalIpProbe::v4(clock.clone()));
    let public_v4: Arc<dyn Probe> =
        Arc::new(PublicIpProbe::new(Family::V4, probes_config.public_ip_http_urls.clone(), probes_config.public_ip_dns_resolvers.clone(), ipv4_hysteresis, clock.clone()));
    let public_v6: Arc<dyn Probe> =
        Arc::new(PublicIpProbe::new(Family::V6, probes_config.public_ip_http_urls.clone(), probes_config.public_ip_dns_resolvers.clone(), ipv6_hysteresis, clock.clone()));
    let (_resume_tx, resume_rx) = mpsc::unbounded_channel();
    tokio::spawn(probes::network_monitor::run(vec![local_v4, public_v4, public_v6], resume_rx, reading_tx.clone(), cancel.child_token()));

    // No platform sleep/wake backend is wired in this build; the gate
    // stays permanently open and every probe just runs on its own tick.
    tokio::spawn(probes::sleep_monitor::run(Box::new(NeverSleepSource), sleep_gate, sleep_wake_grace, clock.clone(), reading_tx, cancel.child_token()));

    tokio::spawn(overseer_engine::run_bus(map.clone(), store, clock, reading_rx, on_change_tx, cancel.child_token()));

    SensorPipeline { map, on_change: on_change_rx }
}

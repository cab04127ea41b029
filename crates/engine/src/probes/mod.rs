//! Probes (A): each knows how to take one measurement (`check`) and,
//! for the pollers, how to run forever on an interval (`run_probe_loop`).

pub mod env_probe;
pub mod local_ip;
pub mod network_monitor;
pub mod public_ip;
pub mod sleep_monitor;
pub mod tcp;

use async_trait::async_trait;
use overseer_core::SensorReading;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use sleep_monitor::SleepGate;

/// A one-shot measurement. `start`/poller loops are built generically
/// on top of `check` by `run_probe_loop`; `check` alone backs on-demand
/// triggers (the network monitor, RESET).
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn check(&self) -> SensorReading;
}

/// Drive a probe forever on a fixed interval, publishing each reading
/// to `output`. Skips a tick entirely while the sleep gate reports a
/// suppression window in effect.
pub async fn run_probe_loop(
    probe: Arc<dyn Probe>,
    interval: Duration,
    output: mpsc::UnboundedSender<SensorReading>,
    sleep_gate: Arc<SleepGate>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if sleep_gate.is_suppressed() {
                    continue;
                }
                let reading = probe.check().await;
                if output.send(reading).is_err() {
                    return;
                }
            }
        }
    }
}

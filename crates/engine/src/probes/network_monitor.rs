//! Network-monitor probe (spec.md §4.A): drives the on-demand probes
//! (local-IPv4, public-IPv4, public-IPv6) on a 5 s tick, rate-limited so
//! a burst of triggers (e.g. wake-from-sleep immediately followed by
//! the regular tick) coalesces into a single round every 2 s.

use super::Probe;
use overseer_core::SensorReading;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const COALESCE_WINDOW: Duration = Duration::from_secs(2);

/// Runs one round: `check()` on local-IPv4, then public-IPv4, then
/// public-IPv6, forwarding each reading as it completes.
pub async fn run_round(probes: &[Arc<dyn Probe>], output: &mpsc::UnboundedSender<SensorReading>) {
    for probe in probes {
        let reading = probe.check().await;
        let _ = output.send(reading);
    }
}

/// Drives `run_round` on `POLL_INTERVAL`, and immediately on `resume`
/// signals, coalescing anything firing within `COALESCE_WINDOW` of the
/// last round.
pub async fn run(
    probes: Vec<Arc<dyn Probe>>,
    mut resume: mpsc::UnboundedReceiver<()>,
    output: mpsc::UnboundedSender<SensorReading>,
    cancel: CancellationToken,
) {
    let last_round = Arc::new(Mutex::new(None::<tokio::time::Instant>));
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                maybe_run(&probes, &output, &last_round).await;
            }
            signal = resume.recv() => {
                if signal.is_none() {
                    return;
                }
                maybe_run(&probes, &output, &last_round).await;
            }
        }
    }
}

async fn maybe_run(
    probes: &[Arc<dyn Probe>],
    output: &mpsc::UnboundedSender<SensorReading>,
    last_round: &Arc<Mutex<Option<tokio::time::Instant>>>,
) {
    let now = tokio::time::Instant::now();
    let mut guard = last_round.lock().await;
    if let Some(last) = *guard {
        if now.duration_since(last) < COALESCE_WINDOW {
            return;
        }
    }
    *guard = Some(now);
    drop(guard);
    run_round(probes, output).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use overseer_core::{Clock, FakeClock, SensorReading};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        calls: Arc<AtomicUsize>,
        clock: FakeClock,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        fn name(&self) -> &str {
            "counting"
        }

        async fn check(&self) -> SensorReading {
            self.calls.fetch_add(1, Ordering::SeqCst);
            SensorReading::online("counting", true, self.clock.now())
        }
    }

    #[tokio::test]
    async fn run_round_checks_every_probe_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = FakeClock::new();
        let probes: Vec<Arc<dyn Probe>> =
            vec![Arc::new(CountingProbe { calls: calls.clone(), clock: clock.clone() })];
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_round(&probes, &tx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn coalesces_a_round_fired_inside_the_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = FakeClock::new();
        let probes: Vec<Arc<dyn Probe>> =
            vec![Arc::new(CountingProbe { calls: calls.clone(), clock })];
        let (tx, _rx) = mpsc::unbounded_channel();
        let last_round = Arc::new(Mutex::new(None));
        maybe_run(&probes, &tx, &last_round).await;
        maybe_run(&probes, &tx, &last_round).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

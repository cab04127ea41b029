//! Sleep/wake suppression window (`spec.md` §4.A "Sleep monitor").
//!
//! Detecting the actual OS sleep/wake events is platform-specific (IOKit
//! power assertions on macOS, logind `PrepareForSleep` on Linux) and
//! genuinely external to this crate's concerns; `SleepGate` is the
//! cooperative contract every poller consults regardless of which
//! platform backend (if any) drives it.

use overseer_core::{sensor_names, Clock, SensorReading};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared suppression window consulted by every polling probe before it
/// does work. `None` means no suppression in effect.
#[derive(Default)]
pub struct SleepGate {
    suppressed_until: Mutex<Option<Instant>>,
}

impl SleepGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called on a sleep-notify event: suppress until the matching wake
    /// arrives (`notify_wake` narrows this to `wake + grace`).
    pub fn notify_sleep(&self) {
        *self.suppressed_until.lock() = Some(Instant::now() + Duration::from_secs(3600));
    }

    pub fn notify_wake(&self, grace: Duration) {
        *self.suppressed_until.lock() = Some(Instant::now() + grace);
    }

    pub fn is_suppressed(&self) -> bool {
        match *self.suppressed_until.lock() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}

/// Platform sleep/wake source. No portable implementation exists in the
/// standard library; a real backend wires OS notifications into
/// `gate.notify_sleep()` / `gate.notify_wake()`. Absent one, the monitor
/// simply never fires and every probe always runs.
#[async_trait::async_trait]
pub trait SleepSource: Send + Sync + 'static {
    async fn next_event(&mut self) -> SleepEvent;
}

pub enum SleepEvent {
    Sleep,
    Wake,
}

/// Drives `gate` from `source` until canceled, publishing a
/// `system_power` reading on each transition.
pub async fn run<C: Clock>(
    mut source: Box<dyn SleepSource>,
    gate: Arc<SleepGate>,
    grace: Duration,
    clock: C,
    output: mpsc::UnboundedSender<SensorReading>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = source.next_event() => {
                match event {
                    SleepEvent::Sleep => {
                        gate.notify_sleep();
                        let reading = SensorReading::text(sensor_names::SYSTEM_POWER, "asleep", clock.now());
                        let _ = output.send(reading);
                    }
                    SleepEvent::Wake => {
                        gate.notify_wake(grace);
                        let reading = SensorReading::text(sensor_names::SYSTEM_POWER, "awake", clock.now());
                        let _ = output.send(reading);
                    }
                }
            }
        }
    }
}

/// A source that never fires. Used on platforms (or in tests) with no
/// sleep/wake backend wired up.
pub struct NeverSleepSource;

#[async_trait::async_trait]
impl SleepSource for NeverSleepSource {
    async fn next_event(&mut self) -> SleepEvent {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_is_not_suppressed_initially() {
        let gate = SleepGate::new();
        assert!(!gate.is_suppressed());
    }

    #[test]
    fn sleep_then_wake_narrows_the_window() {
        let gate = SleepGate::new();
        gate.notify_sleep();
        assert!(gate.is_suppressed());
        gate.notify_wake(Duration::from_millis(0));
        assert!(!gate.is_suppressed());
    }
}

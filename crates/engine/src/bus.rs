//! Sensor bus (spec.md §4.B): the single point that merges readings
//! from every probe into a stable map, detects changes, and persists
//! them. A single consumer task drains the channel so the rule engine
//! only ever sees serialized, already-deduplicated transitions.

use crate::online::OnlinePolicy;
use overseer_core::{sensor_names, Clock, DaemonEventKind, Event, SensorReading};
use overseer_storage::Store;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Thread-safe snapshot of the latest reading per sensor, shared between
/// the bus's consumer task and every reader (rule engine, RPC status
/// handlers).
#[derive(Default)]
pub struct SensorMap {
    inner: RwLock<HashMap<String, SensorReading>>,
}

impl SensorMap {
    pub fn snapshot(&self) -> HashMap<String, SensorReading> {
        self.inner.read().clone()
    }

    pub fn get(&self, sensor: &str) -> Option<SensorReading> {
        self.inner.read().get(sensor).cloned()
    }

    fn set(&self, reading: SensorReading) -> Option<SensorReading> {
        self.inner.write().insert(reading.sensor.clone(), reading)
    }
}

/// Drains `input`, updates `map`, and on every real change appends a
/// `SensorChanged` event to `store` and notifies `on_change`. Errored
/// readings never update the map or fire a change (spec.md: "an errored
/// reading is no new information").
pub async fn run<C: Clock>(
    map: Arc<SensorMap>,
    store: Arc<Store>,
    clock: C,
    mut input: mpsc::UnboundedReceiver<SensorReading>,
    on_change: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            reading = input.recv() => {
                let Some(reading) = reading else { return };
                if reading.is_error() {
                    tracing::warn!(sensor = %reading.sensor, error = ?reading.error, "probe error, ignoring reading");
                    continue;
                }
                tracing::debug!(sensor = %reading.sensor, "sensor reading");
                let previous = map.get(&reading.sensor);
                let changed = previous.as_ref().map(|p| !p.value_eq(&reading)).unwrap_or(true);
                map.set(reading.clone());
                if changed {
                    let event = Event::SensorChanged {
                        sensor: reading.sensor.clone(),
                        old: previous.and_then(|p| describe(&p)),
                        new: describe(&reading),
                        epoch_ms: clock.epoch_ms(),
                    };
                    if let Err(e) = store.append_event(&event) {
                        tracing::warn!(error = %e, "failed to persist sensor change");
                        let failure = Event::DaemonEvent {
                            kind: DaemonEventKind::ExportWriteFailed,
                            details: e.to_string(),
                            epoch_ms: clock.epoch_ms(),
                        };
                        let _ = store.append_event(&failure);
                    }
                    let _ = on_change.send(());
                }
            }
        }
    }
}

fn describe(reading: &SensorReading) -> Option<String> {
    if let Some(online) = reading.online {
        return Some(online.to_string());
    }
    if let Some(ip) = reading.ip {
        return Some(ip.to_string());
    }
    reading.value.clone()
}

/// Computes `online` via `policy` from the current sensor map and
/// republishes it as the passive `online` sensor when it differs from
/// the stored value.
pub fn refresh_online<C: Clock>(map: &SensorMap, policy: &dyn OnlinePolicy, clock: &C) -> bool {
    let snapshot = map.snapshot();
    let online = policy.is_online(&snapshot, clock.now());
    let reading = SensorReading::online(sensor_names::ONLINE, online, clock.now());
    let changed = map.get(sensor_names::ONLINE).map(|p| !p.value_eq(&reading)).unwrap_or(true);
    map.set(reading);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::FakeClock;

    #[tokio::test]
    async fn change_events_fire_once_for_identical_readings() {
        let map = Arc::new(SensorMap::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = FakeClock::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(map.clone(), store.clone(), clock.clone(), rx, change_tx, cancel.clone()));

        tx.send(SensorReading::online("tcp", true, clock.now())).unwrap();
        tx.send(SensorReading::online("tcp", true, clock.now())).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = handle.await;

        let mut changes = 0;
        while change_rx.try_recv().is_ok() {
            changes += 1;
        }
        assert_eq!(changes, 1);
        assert_eq!(store.total_event_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn errored_readings_never_update_the_map() {
        let map = Arc::new(SensorMap::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = FakeClock::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (change_tx, _change_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(map.clone(), store, clock.clone(), rx, change_tx, cancel.clone()));
        tx.send(SensorReading::error("tcp", "boom", clock.now())).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = handle.await;

        assert!(map.get("tcp").is_none());
    }
}

// SPDX-License-Identifier: MIT

//! Glues the sensor bus to the rule engine and the rule engine to the
//! tunnel supervisor (spec.md §4.C/§4.D/§4.E): on every sensor change,
//! recomputes online-ness and the matching rule, applies it to the
//! context manager, and lets the context manager's `on_change` callback
//! drive `TunnelRegistry::reconcile`. A second, independent loop polls
//! tunnel connected-state transitions to slave companions to their
//! parent tunnel and fire desktop notifications (spec.md §4.F/§4.K).

use overseer_core::{
    Condition, Location, Rule, RuleResult, SensorReading, SystemClock, TunnelLifecycleState,
};
use overseer_engine::{
    context::OnContextChange, evaluate_rules, refresh_online, OnlinePolicy, SensorMap, TunnelRegistry,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::DaemonState;

/// Bridges the context manager's synchronous `on_context_change`
/// callback to the async `TunnelRegistry::reconcile`: looks up the
/// matched rule's actions and spawns the reconcile as a detached task
/// (the callback itself cannot `.await`).
pub struct ContextReconciler {
    pub tunnels: Arc<TunnelRegistry>,
    pub rules: Arc<Vec<Rule>>,
}

impl OnContextChange for ContextReconciler {
    fn on_context_change(&self, _old_context: &str, _new_context: &str, matched_rule: Option<&str>) {
        let (connect, disconnect) = match matched_rule.and_then(|name| self.rules.iter().find(|r| r.name == name)) {
            Some(rule) => (rule.actions.connect.clone(), rule.actions.disconnect.clone()),
            None => (Vec::new(), Vec::new()),
        };
        let tunnels = self.tunnels.clone();
        tokio::spawn(async move {
            tunnels.reconcile(&connect, &disconnect).await;
        });
    }
}

/// Drains sensor-change notifications, re-evaluates online-ness and the
/// matching rule, and applies the result to the context manager.
pub async fn run_context_loop(
    state: Arc<DaemonState>,
    rules: Vec<Rule>,
    locations: Vec<Location>,
    online_policy: Arc<dyn OnlinePolicy>,
    reconciler: ContextReconciler,
    mut on_change: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = on_change.recv() => {
                if signal.is_none() {
                    return;
                }
                evaluate_and_apply(&state, &rules, &locations, &*online_policy, &reconciler, "sensor_change").await;
            }
        }
    }
}

pub(crate) async fn evaluate_and_apply(
    state: &Arc<DaemonState>,
    rules: &[Rule],
    locations: &[Location],
    online_policy: &dyn OnlinePolicy,
    reconciler: &ContextReconciler,
    trigger: &str,
) {
    let online = refresh_online(&state.sensors, online_policy, &state.clock);
    let readings = readings_with_env_overlay(&state.sensors, rules, locations, &state.clock);
    let result: RuleResult = evaluate_rules(rules, locations, &readings, online);

    let public_ipv4 = readings.get(overseer_core::sensor_names::PUBLIC_IPV4).and_then(|r| r.ip);
    let public_ipv6 = readings.get(overseer_core::sensor_names::PUBLIC_IPV6).and_then(|r| r.ip);
    let local_ipv4 = readings.get(overseer_core::sensor_names::LOCAL_IPV4).and_then(|r| r.ip);

    let mut context = state.context.lock().await;
    context.apply(result, public_ipv4, public_ipv6, local_ipv4, trigger, &state.store, reconciler);
}

/// `env:VAR` sensors are checked synchronously at evaluation time rather
/// than polled (see `probes::env_probe`); this walks every condition
/// tree reachable from `rules`/`locations`, collects the referenced
/// variable names, and overlays a fresh reading for each on top of the
/// polled snapshot.
fn readings_with_env_overlay(map: &SensorMap, rules: &[Rule], locations: &[Location], clock: &SystemClock) -> HashMap<String, SensorReading> {
    use overseer_core::Clock;

    let mut names = HashSet::new();
    for rule in rules {
        if let Some(condition) = &rule.condition {
            collect_env_sensors(condition, &mut names);
        }
    }
    for location in locations {
        collect_env_sensors(&location.condition, &mut names);
    }

    let mut readings = map.snapshot();
    for sensor in names {
        let Some(var) = sensor.strip_prefix("env:") else { continue };
        let reading = match std::env::var(var) {
            Ok(value) => SensorReading::text(&sensor, value, clock.now()),
            Err(_) => SensorReading::error(&sensor, "unset", clock.now()),
        };
        readings.insert(sensor, reading);
    }
    readings
}

fn collect_env_sensors(condition: &Condition, out: &mut HashSet<String>) {
    match condition {
        Condition::Sensor { sensor, .. } => {
            if sensor.starts_with("env:") {
                out.insert(sensor.clone());
            }
        }
        Condition::Bool { sensor, .. } => {
            if sensor.starts_with("env:") {
                out.insert(sensor.clone());
            }
        }
        Condition::All { children } | Condition::Any { children } => {
            for child in children {
                collect_env_sensors(child, out);
            }
        }
    }
}

/// Polls every tunnel's connected-state on a short interval and, on a
/// transition, slaves its companions (spec.md §4.F) and fires a desktop
/// notification (spec.md §4.K). A poll rather than a push because
/// `tunnel_supervisor::run` has no hook for this; the interval is far
/// tighter than anything a human would notice as latency.
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run_tunnel_watch(state: Arc<DaemonState>, cancel: CancellationToken) {
    let mut last_state: HashMap<String, TunnelLifecycleState> = HashMap::new();
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let aliases: Vec<String> = state.tunnels.aliases().cloned().collect();
                for alias in aliases {
                    let Some(handle) = state.tunnels.get(&alias) else { continue };
                    let (current, retry_count) = {
                        let guard = handle.state.lock().await;
                        (guard.state, guard.retry_count)
                    };
                    let previous = last_state.insert(alias.clone(), current);

                    if previous == Some(current) {
                        continue;
                    }

                    state.companions.on_tunnel_state_change(&alias, current == TunnelLifecycleState::Connected).await;

                    if let Some(previous) = previous {
                        notify_on_transition(&state, &alias, previous, current, retry_count).await;
                    }
                }
            }
        }
    }
}

async fn notify_on_transition(
    state: &Arc<DaemonState>,
    alias: &str,
    previous: TunnelLifecycleState,
    current: TunnelLifecycleState,
    retry_count: u32,
) {
    use TunnelLifecycleState::*;
    let message = match (previous, current) {
        (Reconnecting, Connected) => Some(format!("{alias} reconnected after {retry_count} attempt(s)")),
        (Reconnecting, Disconnected) => Some(format!("{alias} gave up reconnecting")),
        _ => None,
    };
    if let Some(message) = message {
        let _ = state.notify.notify("Overseer", &message).await;
    }
}

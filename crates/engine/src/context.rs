//! Context manager (spec.md §4.D): owns the most recent `RuleResult`,
//! writes export files on change, and notifies the tunnel supervisor.

use overseer_core::{Clock, ContextTransition, DaemonEventKind, Event, ExportBundle, ExportTarget, PreferredIpVersion, RuleResult};
use overseer_storage::Store;
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;

/// Invoked whenever the context changes, with the old and new context
/// names and the name of the rule that produced the new one. This is
/// the connective tissue to the tunnel supervisor.
pub trait OnContextChange: Send + Sync + 'static {
    fn on_context_change(&self, old_context: &str, new_context: &str, matched_rule: Option<&str>);
}

pub struct ContextManager<C: Clock> {
    current: Option<RuleResult>,
    history: VecDeque<ContextTransition>,
    history_cap: usize,
    export_targets: Vec<ExportTarget>,
    preferred_ip_version: PreferredIpVersion,
    clock: C,
}

impl<C: Clock> ContextManager<C> {
    pub fn new(history_cap: usize, export_targets: Vec<ExportTarget>, preferred_ip_version: PreferredIpVersion, clock: C) -> Self {
        Self { current: None, history: VecDeque::new(), history_cap, export_targets, preferred_ip_version, clock }
    }

    pub fn current(&self) -> Option<&RuleResult> {
        self.current.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &ContextTransition> {
        self.history.iter()
    }

    /// Re-evaluate with a freshly computed `RuleResult`. Returns `true`
    /// if the context actually changed (export files were (re)written
    /// and `on_change` was invoked).
    pub fn apply(
        &mut self,
        new_result: RuleResult,
        public_ipv4: Option<IpAddr>,
        public_ipv6: Option<IpAddr>,
        local_ipv4: Option<IpAddr>,
        trigger: &str,
        store: &Store,
        on_change: &dyn OnContextChange,
    ) -> bool {
        let unchanged = self.current.as_ref().map(|c| c.label_eq(&new_result)).unwrap_or(false);
        if unchanged && trigger != "config_reload" {
            return false;
        }

        let previous_overlay = self.current.as_ref().map(|c| c.environment.clone()).unwrap_or_default();
        let old_context = self.current.as_ref().map(|c| c.context.clone()).unwrap_or_else(|| "unknown".to_string());

        let bundle = ExportBundle::new(
            new_result.context.clone(),
            new_result.location.clone(),
            self.preferred_ip_version,
            public_ipv4,
            public_ipv6,
            local_ipv4,
            new_result.environment.clone(),
        );
        self.write_exports(&bundle, &previous_overlay);

        let transition = ContextTransition {
            from: old_context.clone(),
            to: new_result.context.clone(),
            trigger: trigger.to_string(),
            epoch_ms: self.clock.epoch_ms(),
        };
        self.history.push_back(transition.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }

        let event = Event::DaemonEvent {
            kind: DaemonEventKind::ContextTransition,
            details: format!("{} -> {} ({})", transition.from, transition.to, trigger),
            epoch_ms: transition.epoch_ms,
        };
        if let Err(e) = store.append_event(&event) {
            tracing::warn!(error = %e, "failed to persist context transition");
        }

        on_change.on_context_change(&old_context, &new_result.context, new_result.matched_rule.as_deref());
        self.current = Some(new_result);
        true
    }

    fn write_exports(&self, bundle: &ExportBundle, previous_overlay: &BTreeMap<String, String>) {
        for target in &self.export_targets {
            let body = match &target.shape {
                overseer_core::ExportShape::Dotenv => bundle.render_dotenv(previous_overlay),
                overseer_core::ExportShape::Scalar(field) => bundle.render_scalar(*field),
            };
            if let Err(e) = write_atomic(&target.path, body.as_bytes()) {
                tracing::warn!(path = %target.path.display(), error = %e, "export write failed");
            }
        }
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::FakeClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingCallback(Arc<AtomicUsize>);

    impl OnContextChange for CountingCallback {
        fn on_context_change(&self, _old: &str, _new: &str, _rule: Option<&str>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn result(context: &str) -> RuleResult {
        RuleResult {
            context: context.to_string(),
            context_display: context.to_string(),
            location: "home".to_string(),
            location_display: "Home".to_string(),
            matched_rule: Some(context.to_string()),
            environment: BTreeMap::new(),
        }
    }

    #[test]
    fn first_apply_always_fires() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ContextManager::new(10, vec![], PreferredIpVersion::V4, FakeClock::new());
        let fired = ctx.apply(result("trusted"), None, None, None, "sensor_change", &store, &CountingCallback(calls.clone()));
        assert!(fired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unchanged_result_does_not_refire_unless_reload() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ContextManager::new(10, vec![], PreferredIpVersion::V4, FakeClock::new());
        ctx.apply(result("trusted"), None, None, None, "sensor_change", &store, &CountingCallback(calls.clone()));
        let fired = ctx.apply(result("trusted"), None, None, None, "sensor_change", &store, &CountingCallback(calls.clone()));
        assert!(!fired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_reload_refires_even_when_unchanged() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ContextManager::new(10, vec![], PreferredIpVersion::V4, FakeClock::new());
        ctx.apply(result("trusted"), None, None, None, "sensor_change", &store, &CountingCallback(calls.clone()));
        let fired = ctx.apply(result("trusted"), None, None, None, "config_reload", &store, &CountingCallback(calls.clone()));
        assert!(fired);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn history_is_capped() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ContextManager::new(2, vec![], PreferredIpVersion::V4, FakeClock::new());
        for name in ["a", "b", "c"] {
            ctx.apply(result(name), None, None, None, "sensor_change", &store, &CountingCallback(calls.clone()));
        }
        assert_eq!(ctx.history().count(), 2);
    }
}

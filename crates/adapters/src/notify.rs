//! Desktop notifications on tunnel/context state transitions
//! (`SPEC_FULL.md` §4.K). Best-effort: a failed notification is logged
//! and never surfaces as an error to the caller.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("send failed: {0}")]
    SendFailed(String),
}

#[async_trait]
pub trait NotifyAdapter: Send + Sync + 'static {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError>;
}

/// Desktop notification adapter backed by `notify-rust`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DesktopNotifyAdapter;

impl DesktopNotifyAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotifyAdapter for DesktopNotifyAdapter {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let title = title.to_string();
        let message = message.to_string();
        // notify_rust's Notification::show() is synchronous; run it on the
        // blocking pool so it never stalls the reactor.
        tokio::task::spawn_blocking(move || match notify_rust::Notification::new().summary(&title).body(&message).show() {
            Ok(_) => tracing::debug!(%title, "desktop notification sent"),
            Err(e) => tracing::debug!(%title, error = %e, "desktop notification failed"),
        });
        Ok(())
    }
}

/// No-op adapter used when `notifications_enabled` is false.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifyAdapter;

#[async_trait]
impl NotifyAdapter for NoopNotifyAdapter {
    async fn notify(&self, _title: &str, _message: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::{NotifyAdapter, NotifyError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    pub struct NotifyCall {
        pub title: String,
        pub message: String,
    }

    #[derive(Clone, Default)]
    pub struct FakeNotifyAdapter {
        calls: Arc<Mutex<Vec<NotifyCall>>>,
    }

    impl FakeNotifyAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<NotifyCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl NotifyAdapter for FakeNotifyAdapter {
        async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
            self.calls.lock().push(NotifyCall { title: title.to_string(), message: message.to_string() });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeNotifyAdapter;
    use super::*;

    #[tokio::test]
    async fn fake_adapter_records_calls() {
        let adapter = FakeNotifyAdapter::new();
        adapter.notify("lab connected", "context trusted").await.unwrap();
        let calls = adapter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].title, "lab connected");
    }

    #[tokio::test]
    async fn noop_adapter_never_errors() {
        let adapter = NoopNotifyAdapter;
        adapter.notify("x", "y").await.unwrap();
    }
}

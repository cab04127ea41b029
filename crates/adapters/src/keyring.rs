//! Keyring integration is an external collaborator (`spec.md` §1): this
//! crate only defines the interface the askpass handler consumes, plus
//! a couple of trivial implementations for tests and for hosts with no
//! keyring configured.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("no password stored for tunnel {0:?}")]
    NotFound(String),

    #[error("keyring backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait KeyringProvider: Send + Sync + 'static {
    async fn password_for(&self, alias: &str) -> Result<String, KeyringError>;
}

/// The OS keychain/credential-manager backend, via the `keyring` crate.
/// Entries are looked up under a fixed service name so they don't
/// collide with unrelated applications storing secrets for the same
/// alias.
const SERVICE_NAME: &str = "overseer";

#[derive(Debug, Clone, Copy, Default)]
pub struct OsKeyringProvider;

#[async_trait]
impl KeyringProvider for OsKeyringProvider {
    async fn password_for(&self, alias: &str) -> Result<String, KeyringError> {
        let alias = alias.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(SERVICE_NAME, &alias).map_err(|e| KeyringError::Backend(e.to_string()))?;
            match entry.get_password() {
                Ok(password) => Ok(password),
                Err(keyring::Error::NoEntry) => Err(KeyringError::NotFound(alias)),
                Err(e) => Err(KeyringError::Backend(e.to_string())),
            }
        })
        .await
        .map_err(|e| KeyringError::Backend(e.to_string()))?
    }
}

/// Always reports no password stored. Used when the host has no keyring
/// configured; ssh then falls back to its own interactive/batch
/// behavior outside the askpass path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopKeyringProvider;

#[async_trait]
impl KeyringProvider for NoopKeyringProvider {
    async fn password_for(&self, alias: &str) -> Result<String, KeyringError> {
        Err(KeyringError::NotFound(alias.to_string()))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::{KeyringError, KeyringProvider};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    pub struct InMemoryKeyringProvider {
        passwords: Arc<Mutex<HashMap<String, String>>>,
    }

    impl InMemoryKeyringProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set(&self, alias: impl Into<String>, password: impl Into<String>) {
            self.passwords.lock().await.insert(alias.into(), password.into());
        }
    }

    #[async_trait]
    impl KeyringProvider for InMemoryKeyringProvider {
        async fn password_for(&self, alias: &str) -> Result<String, KeyringError> {
            self.passwords.lock().await.get(alias).cloned().ok_or_else(|| KeyringError::NotFound(alias.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryKeyringProvider;
    use super::*;

    #[tokio::test]
    async fn noop_provider_always_reports_not_found() {
        let provider = NoopKeyringProvider;
        assert!(matches!(provider.password_for("lab").await, Err(KeyringError::NotFound(_))));
    }

    #[tokio::test]
    async fn in_memory_provider_round_trips() {
        let provider = InMemoryKeyringProvider::new();
        provider.set("lab", "hunter2").await;
        assert_eq!(provider.password_for("lab").await.unwrap(), "hunter2");
        assert!(provider.password_for("other").await.is_err());
    }
}

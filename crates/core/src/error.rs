//! Core-level errors. Every other crate defines its own `thiserror` enum
//! at its root; this one covers the data-model layer only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown tunnel alias: {0}")]
    UnknownAlias(String),

    #[error("unknown companion: {alias}/{name}")]
    UnknownCompanion { alias: String, name: String },

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

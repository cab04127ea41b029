use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown tunnel alias: {0}")]
    UnknownTunnel(String),

    #[error("unknown companion {name} on tunnel {alias}")]
    UnknownCompanion { alias: String, name: String },

    #[error("ssh spawn failed: {0}")]
    SshSpawn(#[from] overseer_adapters::SshError),

    #[error("pty spawn failed: {0}")]
    PtySpawn(#[from] overseer_pty::PtyError),

    #[error("storage error: {0}")]
    Storage(#[from] overseer_storage::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

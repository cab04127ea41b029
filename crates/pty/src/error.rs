use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to fork pty: {0}")]
    Fork(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wait failed: {0}")]
    Wait(#[from] nix::errno::Errno),

    #[error("exec failed: {0}")]
    Exec(std::io::Error),
}

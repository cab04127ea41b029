use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty request line")]
    EmptyLine,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing required argument for {command}: {arg}")]
    MissingArgument { command: String, arg: String },

    #[error("invalid argument for {command}: {detail}")]
    InvalidArgument { command: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//! Error types for agent-relay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("No available agent: {0}")]
    NoAvailableAgent(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn transport(s: impl Into<String>) -> Self {
        Error::Transport(s.into())
    }

    pub fn codec(s: impl Into<String>) -> Self {
        Error::Codec(s.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Transport(format!("sqlite: {}", e))
    }
}

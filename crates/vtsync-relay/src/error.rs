//! Error types for the relay

use thiserror::Error;

use crate::config::ConfigError;

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Direct output callbacks are not supported for session {0}")]
    DirectOutputUnsupported(String),

    #[error("Buffer manager is shut down")]
    ShutDown,

    #[error("Session {0} has no stream log")]
    NoStreamLog(String),

    #[error("Malformed stream log record at line {line}: {reason}")]
    StreamLog { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

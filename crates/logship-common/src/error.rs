//! Error types for the logship agent.

use thiserror::Error;

/// Result type alias for logship operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the logship agent.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Source or sink failed to initialize
    #[error("Init failure: {0}")]
    InitFailure(String),

    /// A durable record is in a state the engine does not recognize
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport was shut down while work was still in flight
    #[error("Transport shut down: {0}")]
    TransportClosed(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

//! Error types for StatusLens

use thiserror::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the StatusLens background service
#[derive(Error, Debug)]
pub enum Error {
    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Change notifier error: {0}")]
    Notifier(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

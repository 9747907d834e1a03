//! Error types for the Cellar engine.
//!
//! Rejected cell and value writes are not errors: they are recorded in the
//! transaction log and reported to invalid listeners. Only malformed input
//! and caller mistakes surface here.

use thiserror::Error;

/// All possible errors from the Cellar engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Input errors
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // Clock errors
    #[error("invalid hlc: {0}")]
    InvalidHlc(String),

    // Sync errors
    #[error("unexpected sync message: {0}")]
    UnexpectedMessage(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidJson(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

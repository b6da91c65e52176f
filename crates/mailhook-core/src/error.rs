//! Error types for collaborator and model operations.
//!
//! Store adapters map their backend failures onto `CoreError` so the
//! delivery pipeline can treat every collaborator uniformly.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for collaborator operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Key-value, settings or route store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}

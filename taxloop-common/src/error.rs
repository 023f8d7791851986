//! Common error types for taxloop

use thiserror::Error;

/// Common result type for taxloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the taxloop workspace
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Consistency violation: stale version, double rollback, illegal
    /// status transition. Never silently ignored by callers.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Capability service failure (completion/embedding) after retries
    #[error("Capability error: {0}")]
    Capability(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when retrying the same call may succeed (transient capability
    /// or infrastructure failures). Consistency and validation errors are
    /// never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Capability(_) | Error::Database(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON serialization error: {}", e))
    }
}

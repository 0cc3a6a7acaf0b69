//! Public error type of the queue manager
//!
//! Wraps the engine's errors in a stable set of variants. Variants line up
//! with what a caller can do about them: retry (`Conflict`), fix the call
//! (`QueueNotFound`, `InvalidInput`, `InvalidOperation`), find out what
//! happened (`InDoubt`), or give up on this instance (`Disposed`).

use thiserror::Error;

/// All FerryDB errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The queue manager was disposed
    #[error("queue manager has been disposed")]
    Disposed,

    /// Queue does not exist
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Message or record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification; retry the ambient transaction
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bad queue name, uri or argument
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The ambient transaction rolled back
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// The ambient transaction's outcome is unknown
    #[error("transaction outcome in doubt: {0}")]
    InDoubt(String),

    /// In-doubt transactions could not be resolved when opening
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// A blocking wait elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Durable storage failed or is corrupt
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for FerryDB operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Conflicts may succeed when the ambient transaction is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if the queue manager was disposed.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed)
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

// Convert from engine errors
impl From<ferry_core::Error> for Error {
    fn from(e: ferry_core::Error) -> Self {
        use ferry_core::Error as CoreError;
        match e {
            CoreError::Disposed => Error::Disposed,
            CoreError::Conflict(msg) => Error::Conflict(msg),
            CoreError::Io(io) => Error::Io(io),
            CoreError::Serialization(msg) => Error::Serialization(msg),
            CoreError::Corruption(msg) => Error::Storage(format!("corruption: {}", msg)),
            CoreError::Storage(msg) => Error::Storage(msg),
            CoreError::InvalidOperation(msg) => Error::InvalidOperation(msg),
            CoreError::InvalidInput(msg) => Error::InvalidInput(msg),
            CoreError::QueueNotFound(name) => Error::QueueNotFound(name),
            CoreError::NotFound(what) => Error::NotFound(what),
            CoreError::TransactionAborted(msg) => Error::TransactionAborted(msg),
            CoreError::InDoubt(msg) => Error::InDoubt(msg),
            CoreError::Recovery(msg) => Error::Recovery(msg),
            CoreError::Timeout(msg) => Error::Timeout(msg),
        }
    }
}

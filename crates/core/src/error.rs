//! Error types shared by every layer of the queue manager
//!
//! The taxonomy follows the failure classes the engine has to tell apart:
//! - Disposed: the owning store began disposing; the current step must fail
//! - Conflict: store-level contention, transient, retried by the caller
//! - Io / Corruption / Storage: durable write or replay failed
//! - Recovery: in-doubt state could not be resolved at startup

use thiserror::Error;

/// Errors produced by the storage and enlistment engine
#[derive(Debug, Error)]
pub enum Error {
    /// The owning queue manager began disposing
    #[error("queue manager has been disposed")]
    Disposed,

    /// Concurrent modification detected at commit (first committer wins)
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Durable data failed validation
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Storage layer failure (WAL write, commit apply)
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation is not valid in the current state or scope
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Caller supplied invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Queue does not exist
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The ambient transaction was rolled back
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// The ambient transaction outcome is unknown to the caller
    #[error("transaction outcome in doubt: {0}")]
    InDoubt(String),

    /// In-doubt transactions could not be resolved at startup
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// A blocking wait elapsed
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Contention is transient: the ambient transaction can be retried with
    /// fresh reads. Nothing inside the engine retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this error came from a disposed store.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(Error::Conflict("k".into()).is_retryable());
        assert!(!Error::Disposed.is_retryable());
        assert!(!Error::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_detail() {
        let e = Error::QueueNotFound("orders".into());
        assert_eq!(e.to_string(), "queue not found: orders");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}

//! Common error types for vaultsync.

use thiserror::Error;

/// Top-level error type for vaultsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A tree scan failed; the cycle is abandoned and previous trees are kept.
    #[error("Scan failed: {0}")]
    Scan(String),

    /// Sync state could not be written or read back.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Cloud storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transient transport failure, safe to retry.
    #[error("Network error: {0}")]
    Network(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Whether this error means the addressed item does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!Error::NotFound("x".to_string()).is_transient());
        assert!(!Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).is_transient());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::NotFound("x".to_string()).is_not_found());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found());
        assert!(!Error::Storage("x".to_string()).is_not_found());
    }
}

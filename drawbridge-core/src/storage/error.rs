//! Error types for session key storage backends.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by key-value storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached (e.g. storage disabled by the platform).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Filesystem failures of the file-backed store.
    #[error("storage io error: {0}")]
    Io(String),

    /// Serialization/deserialization failures.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A lock guarding the backend was poisoned.
    #[error("storage lock error: {0}")]
    Lock(String),
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

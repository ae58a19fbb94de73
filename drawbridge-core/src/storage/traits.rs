//! Platform interface for durable local storage.

use super::error::StorageResult;

/// String key-value store with the semantics of browser local storage.
///
/// Implementations must be safe to share between threads. Writes are expected
/// to be atomic per key.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored at `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` at `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Deletes the value at `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

//! Session key storage: backend interface, backends and the key store.

pub mod error;
pub mod file;
pub mod key_store;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use key_store::KeyStore;
pub use memory::MemoryStore;
pub use traits::KeyValueStore;

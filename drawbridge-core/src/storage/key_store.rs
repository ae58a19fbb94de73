//! Persistent map of session signing keys, keyed by user address.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::Address;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{KeyValueStore, StorageError, StorageResult};
use crate::defaults::{
    LEGACY_SESSION_SIGNERS_STORAGE_KEY, LEGACY_SIGNER_KEY_PREFIX,
    SESSION_SIGNERS_STORAGE_KEY,
};

/// Serialized form of the signer map: `{ "signers": { "0xabc..": "0x<key>" } }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredSigners {
    #[serde(default)]
    signers: BTreeMap<String, String>,
}

/// Session signer key store.
///
/// The whole map is persisted as one blob under
/// [`SESSION_SIGNERS_STORAGE_KEY`]. Corrupted blobs are logged and reset to an
/// empty map instead of failing.
///
/// If the current key is empty but the blob written under the previous product
/// name exists, that blob is adopted and the legacy key is deleted on the next
/// save.
pub struct KeyStore {
    backend: Arc<dyn KeyValueStore>,
    /// Serializes read-modify-write cycles. The flag records that the loaded map
    /// came from the legacy key and the legacy key still has to be removed.
    legacy_pending: Mutex<bool>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Creates a key store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            legacy_pending: Mutex::new(false),
        }
    }

    /// Returns the session key stored for `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    pub fn get_signer(&self, user: Address) -> StorageResult<Option<SecretString>> {
        let mut pending = self.lock()?;
        let stored = self.load(&mut pending)?;
        Ok(stored
            .signers
            .get(&storage_key_for(user))
            .map(|key| SecretString::from(key.clone())))
    }

    /// Stores `key` as the session key for `user`, replacing any previous key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    pub fn set_signer(&self, user: Address, key: &SecretString) -> StorageResult<()> {
        let mut pending = self.lock()?;
        let mut stored = self.load(&mut pending)?;
        stored
            .signers
            .insert(storage_key_for(user), key.expose_secret().to_string());
        self.save(&mut pending, &stored)
    }

    /// Removes the session key of `user`. Removing a missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    pub fn remove_signer(&self, user: Address) -> StorageResult<()> {
        let mut pending = self.lock()?;
        let mut stored = self.load(&mut pending)?;
        if stored.signers.remove(&storage_key_for(user)).is_some() || *pending {
            self.save(&mut pending, &stored)?;
        }
        Ok(())
    }

    /// Deletes every stored session key, including any legacy blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    pub fn clear(&self) -> StorageResult<()> {
        let mut pending = self.lock()?;
        self.backend.remove(SESSION_SIGNERS_STORAGE_KEY)?;
        self.backend.remove(LEGACY_SESSION_SIGNERS_STORAGE_KEY)?;
        *pending = false;
        Ok(())
    }

    /// Reads a key issued by an earlier release under the per-user legacy location.
    ///
    /// Legacy values were stored JSON-encoded, so surrounding quotes are stripped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    pub fn legacy_signer(&self, user: Address) -> StorageResult<Option<SecretString>> {
        let location = format!("{LEGACY_SIGNER_KEY_PREFIX}{}", storage_key_for(user));
        Ok(self
            .backend
            .get(&location)?
            .map(|value| value.trim().trim_matches('"').to_string())
            .filter(|value| !value.is_empty())
            .map(SecretString::from))
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, bool>> {
        self.legacy_pending
            .lock()
            .map_err(|_| StorageError::Lock("key store mutex poisoned".to_string()))
    }

    fn load(&self, legacy_pending: &mut bool) -> StorageResult<StoredSigners> {
        let current = self
            .backend
            .get(SESSION_SIGNERS_STORAGE_KEY)?
            .filter(|raw| !raw.trim().is_empty());

        let (raw, source) = if let Some(raw) = current {
            (raw, SESSION_SIGNERS_STORAGE_KEY)
        } else if let Some(raw) = self.backend.get(LEGACY_SESSION_SIGNERS_STORAGE_KEY)? {
            if !*legacy_pending {
                log::info!("adopting session signers from legacy storage key");
            }
            *legacy_pending = true;
            (raw, LEGACY_SESSION_SIGNERS_STORAGE_KEY)
        } else {
            return Ok(StoredSigners::default());
        };

        match serde_json::from_str::<StoredSigners>(&raw) {
            Ok(stored) => Ok(stored),
            Err(err) => {
                log::warn!("discarding corrupted session signers under {source}: {err}");
                self.backend.remove(source)?;
                if source == LEGACY_SESSION_SIGNERS_STORAGE_KEY {
                    *legacy_pending = false;
                }
                Ok(StoredSigners::default())
            }
        }
    }

    fn save(&self, legacy_pending: &mut bool, stored: &StoredSigners) -> StorageResult<()> {
        let raw = serde_json::to_string(stored)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.backend.set(SESSION_SIGNERS_STORAGE_KEY, &raw)?;
        if *legacy_pending {
            self.backend.remove(LEGACY_SESSION_SIGNERS_STORAGE_KEY)?;
            *legacy_pending = false;
        }
        Ok(())
    }
}

/// Normalized map key for a user: the lowercased `0x`-prefixed address.
#[must_use]
pub fn storage_key_for(user: Address) -> String {
    format!("0x{}", hex::encode(user.as_slice()))
}

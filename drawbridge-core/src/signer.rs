//! Session signer provisioning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256};
use alloy::signers::local::PrivateKeySigner;
use secrecy::{ExposeSecret, SecretString};

use crate::storage::KeyStore;

/// Loads or creates the session key pair of a user.
///
/// Keys are deterministic per user address: the first call for a user picks a
/// key (legacy location first, otherwise a fresh random key) and persists it
/// through the [`KeyStore`]; later calls return the same key.
///
/// If the key store is unavailable the chosen key is only kept in memory, so the
/// session cannot be restored after a restart.
pub struct SessionSignerProvider {
    store: Arc<KeyStore>,
    ephemeral: Mutex<HashMap<Address, B256>>,
}

impl std::fmt::Debug for SessionSignerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSignerProvider")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl SessionSignerProvider {
    /// Creates a provider writing through to `store`.
    #[must_use]
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self {
            store,
            ephemeral: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the key store backing this provider.
    #[must_use]
    pub const fn key_store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Returns the session signer for `user`.
    #[must_use]
    pub fn signer_for(&self, user: Address) -> PrivateKeySigner {
        match self.store.get_signer(user) {
            Ok(Some(key)) => {
                if let Some(signer) = parse_key(&key) {
                    return signer;
                }
                log::warn!("stored session key for {user} is not a valid private key, replacing it");
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("session key storage unavailable, using an in-memory key: {err}");
                return self.ephemeral_signer(user);
            }
        }

        let signer = self.legacy_signer(user).unwrap_or_else(|| {
            log::debug!("generating session signer for {user}");
            PrivateKeySigner::random()
        });

        if let Err(err) = self.store.set_signer(user, &encode_key(&signer)) {
            log::warn!("failed to persist session key, it will not survive a restart: {err}");
            if let Ok(mut ephemeral) = self.ephemeral.lock() {
                ephemeral.insert(user, signer.to_bytes());
            }
        }

        signer
    }

    fn legacy_signer(&self, user: Address) -> Option<PrivateKeySigner> {
        match self.store.legacy_signer(user) {
            Ok(Some(key)) => {
                let signer = parse_key(&key);
                if signer.is_some() {
                    log::info!("migrating legacy session key for {user}");
                }
                signer
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("failed to read legacy session key: {err}");
                None
            }
        }
    }

    fn ephemeral_signer(&self, user: Address) -> PrivateKeySigner {
        let Ok(mut ephemeral) = self.ephemeral.lock() else {
            return PrivateKeySigner::random();
        };
        if let Some(signer) = ephemeral
            .get(&user)
            .and_then(|bytes| PrivateKeySigner::from_bytes(bytes).ok())
        {
            return signer;
        }
        let signer = PrivateKeySigner::random();
        ephemeral.insert(user, signer.to_bytes());
        signer
    }
}

fn parse_key(key: &SecretString) -> Option<PrivateKeySigner> {
    key.expose_secret().trim().parse::<PrivateKeySigner>().ok()
}

fn encode_key(signer: &PrivateKeySigner) -> SecretString {
    SecretString::from(format!("0x{}", hex::encode(signer.to_bytes())))
}

//! The user's wallet, as seen by the session core.
//!
//! Wallet connector enumeration and UI live outside this crate. Integrations
//! implement [`WalletConnector`] and [`WalletClient`] over whatever wallet stack
//! they use.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::DrawbridgeError;
use crate::registry::TypedCall;
use crate::user_operation::Execution;

/// How the connected user's account signs and executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccountKind {
    /// Smart contract wallet executing through user operations.
    SmartAccount,
    /// Plain externally owned account.
    Eoa,
}

/// A smart account as the bundler sees it.
///
/// While `factory` and `factory_data` are set, operations sent for this account
/// carry its deployment code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDescriptor {
    /// Account address, counterfactual until deployed.
    pub address: Address,
    /// Factory deploying the account.
    pub factory: Option<Address>,
    /// Calldata for the factory.
    pub factory_data: Option<Bytes>,
}

impl AccountDescriptor {
    /// A deployed account.
    #[must_use]
    pub const fn deployed(address: Address) -> Self {
        Self {
            address,
            factory: None,
            factory_data: None,
        }
    }

    /// Whether the descriptor still carries deployment data.
    #[must_use]
    pub const fn has_factory_data(&self) -> bool {
        self.factory.is_some() && self.factory_data.is_some()
    }

    /// Same account without deployment data.
    #[must_use]
    pub const fn without_factory_data(&self) -> Self {
        Self::deployed(self.address)
    }
}

/// A connected wallet able to sign for the user.
#[async_trait]
pub trait WalletClient: Send + Sync {
    /// The user's address.
    fn address(&self) -> Address;

    /// Chain id the wallet is connected to.
    async fn chain_id(&self) -> Result<u64, DrawbridgeError>;

    /// Whether the account is a smart account.
    async fn account_kind(&self) -> Result<AccountKind, DrawbridgeError>;

    /// Descriptor of the user's smart account, `None` for EOAs.
    async fn smart_account(&self) -> Result<Option<AccountDescriptor>, DrawbridgeError>;

    /// Signs EIP-712 typed data. May block on user approval indefinitely.
    ///
    /// Counterfactual smart wallets may return an ERC-6492 wrapped signature.
    async fn sign_typed_data(&self, call: &TypedCall) -> Result<Bytes, DrawbridgeError>;

    /// Sends a plain transaction from the user's wallet and returns its hash.
    async fn send_transaction(&self, to: Address, data: Bytes) -> Result<B256, DrawbridgeError>;

    /// Sends a user operation for `account` through the wallet's own bundler and
    /// returns the user operation hash.
    async fn send_user_operation(
        &self,
        account: &AccountDescriptor,
        calls: &[Execution],
    ) -> Result<B256, DrawbridgeError>;
}

/// Source of wallet connections.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    /// Restores a previous connection. Returns `true` if a wallet is now connected.
    async fn reconnect(&self) -> Result<bool, DrawbridgeError>;

    /// Connects the connector with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::AlreadyConnected`] if a wallet is already
    /// connected through this connector.
    async fn connect(&self, connector_id: &str) -> Result<(), DrawbridgeError>;

    /// Disconnects the current wallet.
    async fn disconnect(&self) -> Result<(), DrawbridgeError>;

    /// Client for the currently connected wallet.
    async fn wallet(&self) -> Result<Option<Arc<dyn WalletClient>>, DrawbridgeError>;

    /// Channel carrying the connected account, `None` while disconnected.
    fn watch(&self) -> watch::Receiver<Option<Address>>;
}

//! Delegation registration.
//!
//! Registering a delegation lets the session account act for the user in the
//! registry. Smart wallets register directly through a user operation; plain
//! accounts sign a typed `Call` that the session account relays through
//! `callWithSignature`. Both paths order their writes the same way: deploy the
//! user's wallet if needed, register the delegation, then deploy the session
//! account.

mod eoa;
mod smart_account;

use crate::error::DrawbridgeError;
use crate::registry::Registry;
use crate::session_client::SessionClient;
use crate::wallet::{AccountKind, WalletClient};

/// Inputs shared by both registration paths.
#[derive(Clone, Copy)]
pub struct DelegationParams<'a> {
    /// The user's wallet.
    pub wallet: &'a dyn WalletClient,
    /// The session client receiving the delegation.
    pub session: &'a SessionClient,
    /// The registry recording the delegation.
    pub registry: Registry,
}

impl std::fmt::Debug for DelegationParams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationParams")
            .field("user", &self.wallet.address())
            .field("session", &self.session.session_address())
            .field("registry", &self.registry)
            .finish()
    }
}

/// How the user's wallet registers the delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DelegationStrategy {
    /// The smart wallet sends `registerDelegation` in its own user operation.
    SmartAccount,
    /// The account signs a `Call` relayed by the session account.
    Eoa,
}

impl DelegationStrategy {
    /// Strategy for a wallet of the given kind.
    #[must_use]
    pub const fn for_account_kind(kind: AccountKind) -> Self {
        match kind {
            AccountKind::SmartAccount => Self::SmartAccount,
            AccountKind::Eoa => Self::Eoa,
        }
    }

    /// Registers an unlimited delegation from the user to the session account
    /// and makes sure the session account is deployed.
    ///
    /// # Errors
    ///
    /// Wallet rejections are returned as is. Deployment races during the
    /// registration become [`DrawbridgeError::DeploymentConflict`].
    pub async fn register_delegation(
        self,
        params: &DelegationParams<'_>,
    ) -> Result<(), DrawbridgeError> {
        log::info!(
            "registering {self} delegation from {} to {}",
            params.wallet.address(),
            params.session.session_address()
        );
        match self {
            Self::SmartAccount => smart_account::register(params).await,
            Self::Eoa => eoa::register(params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_follows_account_kind() {
        assert_eq!(
            DelegationStrategy::for_account_kind(AccountKind::SmartAccount),
            DelegationStrategy::SmartAccount
        );
        assert_eq!(
            DelegationStrategy::for_account_kind(AccountKind::Eoa),
            DelegationStrategy::Eoa
        );
        assert_eq!(DelegationStrategy::SmartAccount.to_string(), "smart_account");
    }
}

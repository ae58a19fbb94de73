//! The session client: a bundler client bound to the session account.

use std::sync::Arc;

use alloy::primitives::aliases::U192;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;

use crate::account::SessionAccount;
use crate::bundler::{wait_for_user_operation_receipt, Bundler, GasSponsor};
use crate::chain::ChainClient;
use crate::config::Timings;
use crate::error::DrawbridgeError;
use crate::fees::FeePolicy;
use crate::registry::{Registry, ResourceId};
use crate::user_operation::{dummy_signature, Execution, UserOperation, UserOperationReceipt};

#[allow(missing_docs)]
mod bindings {
    use alloy::sol;

    sol! {
        interface IEntryPoint {
            function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
        }
    }
}

use bindings::IEntryPoint;

/// Sends user operations from the session account on behalf of a user.
///
/// Writes to the registry are routed through `callFrom`, so they execute with the
/// user's delegation instead of the session account's own identity.
pub struct SessionClient {
    account: Arc<SessionAccount>,
    user_address: Address,
    registry: Option<Registry>,
    bundler: Arc<dyn Bundler>,
    sponsor: Option<Arc<dyn GasSponsor>>,
    fee_policy: FeePolicy,
    timings: Timings,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("account", &self.account)
            .field("user_address", &self.user_address)
            .field("registry", &self.registry)
            .field("sponsored", &self.sponsor.is_some())
            .field("fee_policy", &self.fee_policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionClient`].
pub struct SessionClientBuilder {
    account: Arc<SessionAccount>,
    user_address: Address,
    bundler: Arc<dyn Bundler>,
    registry: Option<Registry>,
    sponsor: Option<Arc<dyn GasSponsor>>,
    fee_policy: Option<FeePolicy>,
    timings: Timings,
}

impl SessionClientBuilder {
    /// Starts a client for `account` acting for `user_address` through `bundler`.
    #[must_use]
    pub fn new(
        account: Arc<SessionAccount>,
        user_address: Address,
        bundler: Arc<dyn Bundler>,
    ) -> Self {
        Self {
            account,
            user_address,
            bundler,
            registry: None,
            sponsor: None,
            fee_policy: None,
            timings: Timings::default(),
        }
    }

    /// Routes delegated writes to `registry`.
    #[must_use]
    pub const fn registry(mut self, registry: Option<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sponsors operations through `sponsor`.
    #[must_use]
    pub fn sponsor(mut self, sponsor: Option<Arc<dyn GasSponsor>>) -> Self {
        self.sponsor = sponsor;
        self
    }

    /// Overrides the fee policy of the account's chain.
    #[must_use]
    pub const fn fee_policy(mut self, fee_policy: FeePolicy) -> Self {
        self.fee_policy = Some(fee_policy);
        self
    }

    /// Sets receipt polling and deadlines.
    #[must_use]
    pub const fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> SessionClient {
        let fee_policy = self
            .fee_policy
            .unwrap_or_else(|| FeePolicy::for_chain(self.account.chain_id()));
        SessionClient {
            account: self.account,
            user_address: self.user_address,
            registry: self.registry,
            bundler: self.bundler,
            sponsor: self.sponsor,
            fee_policy,
            timings: self.timings,
        }
    }
}

impl SessionClient {
    /// The session account.
    #[must_use]
    pub const fn account(&self) -> &Arc<SessionAccount> {
        &self.account
    }

    /// Session account address.
    #[must_use]
    pub fn session_address(&self) -> Address {
        self.account.address()
    }

    /// The delegating user.
    #[must_use]
    pub const fn user_address(&self) -> Address {
        self.user_address
    }

    /// The delegation registry, if configured.
    #[must_use]
    pub const fn registry(&self) -> Option<Registry> {
        self.registry
    }

    /// The bundler operations are sent to.
    #[must_use]
    pub const fn bundler(&self) -> &Arc<dyn Bundler> {
        &self.bundler
    }

    /// The chain client of the session account.
    #[must_use]
    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        self.account.chain()
    }

    /// Delays and deadlines.
    #[must_use]
    pub const fn timings(&self) -> Timings {
        self.timings
    }

    /// Whether the user delegated to the session account. `true` without a registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn has_delegation(&self) -> Result<bool, DrawbridgeError> {
        let Some(registry) = self.registry else {
            return Ok(true);
        };
        registry
            .has_delegation(
                self.chain().as_ref(),
                self.user_address,
                self.session_address(),
            )
            .await
    }

    /// Builds, prices and signs an operation executing `calls`.
    ///
    /// Fees come from the chain's [`FeePolicy`] and are lowered to the bundler's
    /// cost ceiling before the final paymaster data is fetched, and once more
    /// after it is applied. The signature covers the capped fees.
    ///
    /// # Errors
    ///
    /// Returns an error if any chain, bundler or paymaster request fails.
    pub async fn prepare_user_operation(
        &self,
        calls: &[Execution],
    ) -> Result<UserOperation, DrawbridgeError> {
        let entry_point = self.account.entry_point();
        let chain_id = self.account.chain_id();

        let mut op = UserOperation {
            sender: self.session_address(),
            nonce: self.nonce().await?,
            call_data: SessionAccount::encode_calls(calls),
            signature: dummy_signature(),
            ..Default::default()
        };
        if !self.account.is_deployed().await? {
            let (factory, factory_data) = self.account.factory_args();
            op.factory = Some(factory);
            op.factory_data = Some(factory_data);
        }

        let fees = self.fee_policy.estimate(self.chain().as_ref()).await;
        op.max_fee_per_gas = U256::from(fees.max_fee_per_gas);
        op.max_priority_fee_per_gas = U256::from(fees.max_priority_fee_per_gas);

        if let Some(sponsor) = &self.sponsor {
            sponsor
                .stub_data(&op, entry_point, chain_id)
                .await?
                .apply(&mut op);
        }

        let gas = self
            .bundler
            .estimate_user_operation_gas(&op, entry_point)
            .await?;
        op.call_gas_limit = gas.call_gas_limit;
        op.verification_gas_limit = gas.verification_gas_limit;
        op.pre_verification_gas = gas.pre_verification_gas;
        if gas.paymaster_verification_gas_limit.is_some() {
            op.paymaster_verification_gas_limit = gas.paymaster_verification_gas_limit;
        }
        if gas.paymaster_post_op_gas_limit.is_some() {
            op.paymaster_post_op_gas_limit = gas.paymaster_post_op_gas_limit;
        }

        self.bundler.cap_user_operation(&mut op);

        if let Some(sponsor) = &self.sponsor {
            sponsor
                .sponsor_data(&op, entry_point, chain_id)
                .await?
                .apply(&mut op);
            // final paymaster data may raise the paymaster gas limits
            if self.bundler.cap_user_operation(&mut op) {
                log::warn!(
                    "paymaster gas limits of {} exceeded the cost ceiling, fees lowered",
                    op.sender
                );
            }
        }

        op.signature = self.account.sign_user_operation(&op)?;
        Ok(op)
    }

    /// Prepares and submits an operation, returning its hash.
    ///
    /// # Errors
    ///
    /// Returns an error if preparation or submission fails.
    pub async fn send_user_operation(&self, calls: &[Execution]) -> Result<B256, DrawbridgeError> {
        let op = self.prepare_user_operation(calls).await?;
        let hash = self
            .bundler
            .send_user_operation(&op, self.account.entry_point())
            .await?;
        log::debug!("sent user operation {hash} from {}", op.sender);
        Ok(hash)
    }

    /// Waits for the receipt of a submitted operation.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::Timeout`] if the receipt does not arrive in time.
    pub async fn wait_for_user_operation(
        &self,
        hash: B256,
    ) -> Result<UserOperationReceipt, DrawbridgeError> {
        wait_for_user_operation_receipt(
            self.bundler.as_ref(),
            hash,
            self.timings.receipt_poll_interval(),
            self.timings.receipt_timeout(),
        )
        .await
    }

    /// Sends `calls` and waits for a successful receipt.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::UserOperationFailed`] if the operation reverted.
    pub async fn execute(&self, calls: &[Execution]) -> Result<UserOperationReceipt, DrawbridgeError> {
        let hash = self.send_user_operation(calls).await?;
        let receipt = self.wait_for_user_operation(hash).await?;
        ensure_success(receipt)
    }

    /// Calls `system` with the user's delegation through the registry's `callFrom`.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::InvalidConfig`] without a registry, otherwise
    /// the errors of [`Self::execute`].
    pub async fn call_from(
        &self,
        system: ResourceId,
        call_data: Bytes,
    ) -> Result<UserOperationReceipt, DrawbridgeError> {
        let registry = self.registry.ok_or_else(|| DrawbridgeError::InvalidConfig {
            attribute: "registry_address".to_string(),
            reason: "delegated calls require a registry".to_string(),
        })?;
        let data = Registry::call_from_calldata(self.user_address, system, call_data);
        self.execute(&[Execution::new(registry.address(), data)])
            .await
    }

    async fn nonce(&self) -> Result<U256, DrawbridgeError> {
        let call = IEntryPoint::getNonceCall {
            sender: self.session_address(),
            key: U192::ZERO,
        };
        let output = self
            .chain()
            .call(self.account.entry_point(), call.abi_encode().into())
            .await?;
        Ok(IEntryPoint::getNonceCall::abi_decode_returns(&output)?)
    }
}

/// Turns a failed receipt into [`DrawbridgeError::UserOperationFailed`].
///
/// # Errors
///
/// Returns an error if the receipt reports failure.
pub fn ensure_success(receipt: UserOperationReceipt) -> Result<UserOperationReceipt, DrawbridgeError> {
    if receipt.success {
        return Ok(receipt);
    }
    Err(DrawbridgeError::UserOperationFailed {
        hash: receipt.user_op_hash.to_string(),
        reason: receipt
            .reason
            .clone()
            .unwrap_or_else(|| "user operation reverted".to_string()),
    })
}

//! Bundler and paymaster clients.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::DrawbridgeError;
use crate::transport::{CostCap, RelayTransport, RetryPolicy};
use crate::user_operation::{UserOperation, UserOperationGasEstimate, UserOperationReceipt};

/// ERC-4337 bundler.
#[async_trait]
pub trait Bundler: Send + Sync {
    /// `eth_estimateUserOperationGas`.
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<UserOperationGasEstimate, DrawbridgeError>;

    /// `eth_sendUserOperation`, returning the user operation hash.
    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<B256, DrawbridgeError>;

    /// `eth_getUserOperationReceipt`, `None` while the operation is pending.
    async fn get_user_operation_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<UserOperationReceipt>, DrawbridgeError>;

    /// Lowers the fees of an unsigned operation to the bundler's cost ceiling.
    /// Returns `true` if the fees changed.
    fn cap_user_operation(&self, _op: &mut UserOperation) -> bool {
        false
    }
}

/// Polls `bundler` until the receipt of `hash` is available.
///
/// # Errors
///
/// Returns [`DrawbridgeError::Timeout`] if no receipt arrives before `timeout`.
pub async fn wait_for_user_operation_receipt(
    bundler: &dyn Bundler,
    hash: B256,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<UserOperationReceipt, DrawbridgeError> {
    let poll = async {
        loop {
            if let Some(receipt) = bundler.get_user_operation_receipt(hash).await? {
                return Ok::<_, DrawbridgeError>(receipt);
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| DrawbridgeError::Timeout(format!("receipt for user operation {hash}")))?
}

/// [`Bundler`] over JSON-RPC.
///
/// On fee-capped chains the client carries a [`CostCap`]; operations are capped
/// while they are prepared, before signing.
#[derive(Debug)]
pub struct BundlerClient {
    transport: RelayTransport,
    cost_cap: Option<CostCap>,
}

impl BundlerClient {
    /// Bundler at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            transport: RelayTransport::new(url, retry),
            cost_cap: None,
        }
    }

    /// Enables the per-operation cost ceiling.
    #[must_use]
    pub const fn with_cost_cap(mut self, cost_cap: Option<CostCap>) -> Self {
        self.cost_cap = cost_cap;
        self
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &RelayTransport {
        &self.transport
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<UserOperationGasEstimate, DrawbridgeError> {
        self.transport
            .request("eth_estimateUserOperationGas", json!([op, entry_point]))
            .await
    }

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<B256, DrawbridgeError> {
        if let Some(cap) = self.cost_cap {
            let mut capped = op.clone();
            if cap.apply(&mut capped) {
                log::warn!(
                    "user operation from {} exceeds the cost ceiling ({} > {} wei per gas)",
                    op.sender,
                    op.max_fee_per_gas,
                    capped.max_fee_per_gas
                );
            }
        }
        self.transport
            .request("eth_sendUserOperation", json!([op, entry_point]))
            .await
    }

    async fn get_user_operation_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<UserOperationReceipt>, DrawbridgeError> {
        self.transport
            .request("eth_getUserOperationReceipt", json!([hash]))
            .await
    }

    fn cap_user_operation(&self, op: &mut UserOperation) -> bool {
        self.cost_cap.is_some_and(|cap| cap.apply(op))
    }
}

/// Paymaster fields returned by a gas sponsor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorData {
    /// Paymaster contract.
    pub paymaster: Address,
    /// Paymaster specific data.
    #[serde(default)]
    pub paymaster_data: Bytes,
    /// Paymaster validation gas, if the sponsor sets it.
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    /// Paymaster post-op gas, if the sponsor sets it.
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

impl SponsorData {
    /// Writes the paymaster fields into `op`. Gas limits already on the operation
    /// are kept when the sponsor leaves them out.
    pub fn apply(&self, op: &mut UserOperation) {
        op.paymaster = Some(self.paymaster);
        op.paymaster_data = Some(self.paymaster_data.clone());
        if self.paymaster_verification_gas_limit.is_some() {
            op.paymaster_verification_gas_limit = self.paymaster_verification_gas_limit;
        }
        if self.paymaster_post_op_gas_limit.is_some() {
            op.paymaster_post_op_gas_limit = self.paymaster_post_op_gas_limit;
        }
    }
}

/// Pays for session user operations.
#[async_trait]
pub trait GasSponsor: Send + Sync {
    /// Placeholder paymaster data used during gas estimation.
    async fn stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError>;

    /// Final paymaster data for the estimated operation.
    async fn sponsor_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError>;
}

/// ERC-7677 paymaster web service.
#[derive(Debug)]
pub struct Erc7677Paymaster {
    transport: RelayTransport,
    context: Value,
}

impl Erc7677Paymaster {
    /// Paymaster service at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            transport: RelayTransport::new(url, retry),
            context: json!({}),
        }
    }

    /// Sets the service specific context sent with every request.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    async fn request(
        &self,
        method: &str,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError> {
        let params = json!([op, entry_point, format!("{chain_id:#x}"), self.context]);
        self.transport.request(method, params).await
    }
}

#[async_trait]
impl GasSponsor for Erc7677Paymaster {
    async fn stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError> {
        self.request("pm_getPaymasterStubData", op, entry_point, chain_id)
            .await
    }

    async fn sponsor_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError> {
        self.request("pm_getPaymasterData", op, entry_point, chain_id)
            .await
    }
}

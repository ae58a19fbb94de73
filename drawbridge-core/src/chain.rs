//! Read access to the chain and transaction receipts.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportError;
use async_trait::async_trait;

use crate::defaults::RECEIPT_POLL_INTERVAL_MS;
use crate::error::DrawbridgeError;
use crate::fees::FeeEstimate;

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOutcome {
    /// Transaction hash.
    pub hash: B256,
    /// `false` if the transaction reverted.
    pub success: bool,
}

/// Public chain client used for reads and receipt waits.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain id reported by the node.
    async fn chain_id(&self) -> Result<u64, DrawbridgeError>;

    /// Deployed bytecode at `address`, empty for counterfactual accounts.
    async fn get_code(&self, address: Address) -> Result<Bytes, DrawbridgeError>;

    /// Executes an `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, DrawbridgeError>;

    /// Current EIP-1559 fee estimate.
    async fn estimate_eip1559_fees(&self) -> Result<FeeEstimate, DrawbridgeError>;

    /// Waits until `hash` is mined or `timeout` elapses.
    async fn wait_for_transaction_receipt(
        &self,
        hash: B256,
        timeout: Duration,
    ) -> Result<TransactionOutcome, DrawbridgeError>;
}

/// [`ChainClient`] over an alloy HTTP provider.
#[derive(Clone)]
pub struct RpcChainClient {
    provider: DynProvider,
    poll_interval: Duration,
}

impl std::fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChainClient")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RpcChainClient {
    /// Connects to the JSON-RPC endpoint at `rpc_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if `rpc_url` is not a valid URL.
    pub fn new(rpc_url: &str) -> Result<Self, DrawbridgeError> {
        let url = Url::parse(rpc_url).map_err(|err| DrawbridgeError::InvalidConfig {
            attribute: "rpc_url".to_string(),
            reason: err.to_string(),
        })?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self::from_provider(provider))
    }

    /// Wraps an existing provider.
    #[must_use]
    pub const fn from_provider(provider: DynProvider) -> Self {
        Self {
            provider,
            poll_interval: Duration::from_millis(RECEIPT_POLL_INTERVAL_MS),
        }
    }

    /// Sets the interval between receipt polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The underlying provider.
    #[must_use]
    pub const fn provider(&self) -> &DynProvider {
        &self.provider
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> Result<u64, DrawbridgeError> {
        self.provider.get_chain_id().await.map_err(rpc_error)
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, DrawbridgeError> {
        self.provider.get_code_at(address).await.map_err(rpc_error)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, DrawbridgeError> {
        let request = TransactionRequest::default().to(to).input(data.into());
        self.provider.call(request).await.map_err(rpc_error)
    }

    async fn estimate_eip1559_fees(&self) -> Result<FeeEstimate, DrawbridgeError> {
        let estimate = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(rpc_error)?;
        Ok(FeeEstimate::new(
            estimate.max_fee_per_gas,
            estimate.max_priority_fee_per_gas,
        ))
    }

    async fn wait_for_transaction_receipt(
        &self,
        hash: B256,
        timeout: Duration,
    ) -> Result<TransactionOutcome, DrawbridgeError> {
        let poll = async {
            loop {
                if let Some(receipt) = self
                    .provider
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(rpc_error)?
                {
                    return Ok::<_, DrawbridgeError>(TransactionOutcome {
                        hash,
                        success: receipt.status(),
                    });
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| DrawbridgeError::Timeout(format!("receipt for transaction {hash}")))?
    }
}

fn rpc_error(err: TransportError) -> DrawbridgeError {
    err.as_error_resp().map_or_else(
        || DrawbridgeError::Generic(format!("rpc transport error: {err}")),
        |payload| DrawbridgeError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
    )
}

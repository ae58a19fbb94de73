//! JSON-RPC transport to the bundler and paymaster endpoints.
//!
//! Requests are retried with exponential backoff when the endpoint rate limits
//! (HTTP 429) or cannot be reached. Every other HTTP response is handed back
//! unmodified: JSON-RPC error objects become [`DrawbridgeError::Rpc`], other
//! failing statuses become [`DrawbridgeError::NetworkError`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::U256;
use backon::{ExponentialBuilder, Retryable};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::defaults::{
    COST_SAFETY_MARGIN, DEFAULT_ETH_PRICE_USD, MAX_USER_OPERATION_COST_USD, RETRY_BASE_DELAY_MS,
    RETRY_MAX_DELAY_MS, RETRY_MAX_RETRIES,
};
use crate::error::DrawbridgeError;
use crate::user_operation::UserOperation;

const WEI_PER_ETH: f64 = 1e18;

/// Backoff parameters for rate-limited requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds. Doubles on every retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Number of retries after the first attempt.
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: RETRY_BASE_DELAY_MS,
            max_delay_ms: RETRY_MAX_DELAY_MS,
            max_retries: RETRY_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff without jitter: `base, 2*base, 4*base, ..` capped at the max delay.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
    }
}

/// Per-operation cost ceiling on fee-capped chains.
///
/// `total_gas * max_fee_per_gas * eth_price_usd` must stay below the USD budget.
/// The price is inflated by the safety margin before the ceiling is computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostCap {
    /// Budget for a single operation, in USD.
    pub budget_usd: f64,
    /// Assumed ETH/USD price.
    pub eth_price_usd: f64,
    /// Multiplier applied to the price.
    pub safety_margin: f64,
}

impl Default for CostCap {
    fn default() -> Self {
        Self {
            budget_usd: MAX_USER_OPERATION_COST_USD,
            eth_price_usd: DEFAULT_ETH_PRICE_USD,
            safety_margin: COST_SAFETY_MARGIN,
        }
    }
}

impl CostCap {
    /// Cap using the given ETH/USD price, or the default price.
    #[must_use]
    pub fn with_eth_price(eth_price_usd: Option<f64>) -> Self {
        let mut cap = Self::default();
        if let Some(price) = eth_price_usd.filter(|price| price.is_finite() && *price > 0.0) {
            cap.eth_price_usd = price;
        }
        cap
    }

    /// Budget in wei, rounded down.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn budget_wei(&self) -> u128 {
        let wei = self.budget_usd / (self.eth_price_usd * self.safety_margin) * WEI_PER_ETH;
        if wei.is_finite() && wei > 0.0 {
            wei.floor() as u128
        } else {
            0
        }
    }

    /// Highest `maxFeePerGas` keeping an operation with `total_gas` inside the budget.
    /// `None` when the operation declares no gas.
    #[must_use]
    pub fn fee_ceiling(&self, total_gas: U256) -> Option<u128> {
        if total_gas.is_zero() {
            return None;
        }
        let ceiling = U256::from(self.budget_wei()) / total_gas;
        Some(ceiling.saturating_to())
    }

    /// Lowers the operation fees to the ceiling, keeping `max fee >= priority fee`.
    /// Returns `true` if the fees were changed.
    pub fn apply(&self, op: &mut UserOperation) -> bool {
        let Some(ceiling) = self.fee_ceiling(op.total_gas()) else {
            return false;
        };
        let ceiling = U256::from(ceiling);
        if op.max_fee_per_gas <= ceiling {
            return false;
        }
        log::debug!(
            "capping maxFeePerGas from {} to {ceiling} for {} gas",
            op.max_fee_per_gas,
            op.total_gas()
        );
        op.max_fee_per_gas = ceiling;
        if op.max_priority_fee_per_gas > ceiling {
            op.max_priority_fee_per_gas = ceiling;
        }
        true
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC over HTTP with rate-limit retries.
pub struct RelayTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("url", &self.url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RelayTransport {
    /// Creates a transport posting to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: Duration::from_secs(30),
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Retry policy in use.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Calls `method` with `params` and decodes the `result` member.
    ///
    /// # Errors
    ///
    /// Returns the JSON-RPC error object, the failing HTTP status, or the network
    /// error of the last attempt once retries are exhausted.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, DrawbridgeError>
    where
        P: Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        })?;

        let (status, text) = (|| async { self.send_once(&body).await })
            .retry(self.retry.backoff())
            .when(RequestHandleError::is_retryable)
            .notify(|err: &RequestHandleError, delay: Duration| {
                log::warn!(
                    "{method} to {} failed ({}), retrying in {delay:?}",
                    self.url,
                    err.error
                );
            })
            .await
            .map_err(DrawbridgeError::from)?;

        decode_response(&self.url, status, &text)
    }

    async fn send_once(&self, body: &[u8]) -> Result<(StatusCode, String), RequestHandleError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                format!("drawbridge-core/{}", env!("CARGO_PKG_VERSION")),
            )
            .body(body.to_vec())
            .send()
            .await
            .map_err(|err| {
                let retryable = err.is_timeout() || err.is_connect();
                RequestHandleError {
                    url: self.url.clone(),
                    status: None,
                    error: format!("request failed: {err}"),
                    retryable,
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| RequestHandleError {
            url: self.url.clone(),
            status: Some(status.as_u16()),
            error: format!("failed to read response body: {err}"),
            retryable: false,
        })?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let detail = if text.trim().is_empty() {
                "rate limited".to_string()
            } else {
                text
            };
            return Err(RequestHandleError {
                url: self.url.clone(),
                status: Some(status.as_u16()),
                error: detail,
                retryable: true,
            });
        }

        Ok((status, text))
    }
}

fn decode_response<R: DeserializeOwned>(
    url: &str,
    status: StatusCode,
    text: &str,
) -> Result<R, DrawbridgeError> {
    let parsed = serde_json::from_str::<JsonRpcResponse>(text);
    if let Ok(JsonRpcResponse {
        error: Some(error), ..
    }) = parsed
    {
        return Err(DrawbridgeError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    if !status.is_success() {
        return Err(DrawbridgeError::NetworkError {
            url: url.to_string(),
            status: Some(status.as_u16()),
            error: text.to_string(),
        });
    }
    let response = parsed.map_err(|err| {
        DrawbridgeError::SerializationError(format!("invalid JSON-RPC response from {url}: {err}"))
    })?;
    // a `null` result is valid for optional lookups such as pending receipts
    let result = response.result.unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|err| {
        DrawbridgeError::SerializationError(format!("unexpected result from {url}: {err}"))
    })
}

#[derive(Debug)]
struct RequestHandleError {
    url: String,
    status: Option<u16>,
    error: String,
    retryable: bool,
}

impl RequestHandleError {
    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<RequestHandleError> for DrawbridgeError {
    fn from(value: RequestHandleError) -> Self {
        Self::NetworkError {
            url: value.url,
            status: value.status,
            error: value.error,
        }
    }
}

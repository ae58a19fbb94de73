//! Runtime configuration.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEPLOYMENT_SETTLE_DELAY_MS, ENTRY_POINT_V07, RECEIPT_POLL_INTERVAL_MS, RECEIPT_TIMEOUT_MS,
    SESSION_DEPLOYMENT_TIMEOUT_MS,
};
use crate::error::DrawbridgeError;
use crate::fees::FeePolicy;
use crate::transport::{CostCap, RetryPolicy};

/// Factory deploying session accounts.
///
/// Session account addresses are derived off-chain from these parameters, so
/// they must match the deployed factory exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFactoryConfig {
    /// Factory contract exposing `createAccount(owner, salt)`.
    pub factory: Address,
    /// Account implementation behind the proxy.
    pub implementation: Address,
    /// Creation code of the proxy the factory deploys with CREATE2.
    pub proxy_creation_code: Bytes,
    /// Salt passed to `createAccount`.
    #[serde(default)]
    pub salt: U256,
}

/// Delays and deadlines of the delegation flow, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Timings {
    pub settle_delay_ms: u64,
    pub deployment_timeout_ms: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEPLOYMENT_SETTLE_DELAY_MS,
            deployment_timeout_ms: SESSION_DEPLOYMENT_TIMEOUT_MS,
            receipt_poll_interval_ms: RECEIPT_POLL_INTERVAL_MS,
            receipt_timeout_ms: RECEIPT_TIMEOUT_MS,
        }
    }
}

impl Timings {
    /// Wait after deploying the user's wallet, before the bundler is used.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Deadline of the session account deployment.
    #[must_use]
    pub const fn deployment_timeout(&self) -> Duration {
        Duration::from_millis(self.deployment_timeout_ms)
    }

    /// Interval between receipt polls.
    #[must_use]
    pub const fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    /// Deadline for receipts.
    #[must_use]
    pub const fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }
}

fn default_entry_point() -> Address {
    ENTRY_POINT_V07
}

/// Configuration of a [`crate::Drawbridge`] instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawbridgeConfig {
    /// Chain the wallet must be connected to.
    pub chain_id: u64,
    /// Public JSON-RPC endpoint.
    pub rpc_url: String,
    /// ERC-4337 bundler endpoint.
    pub bundler_url: String,
    /// Optional ERC-7677 paymaster endpoint sponsoring session operations.
    #[serde(default)]
    pub paymaster_url: Option<String>,
    /// Delegation registry. Without one, sessions are considered ready as soon
    /// as the wallet connects.
    #[serde(default)]
    pub registry_address: Option<String>,
    /// ERC-4337 entry point.
    #[serde(default = "default_entry_point")]
    pub entry_point: Address,
    /// Session account factory.
    pub account_factory: AccountFactoryConfig,
    /// ETH/USD price used by the cost cap.
    #[serde(default)]
    pub eth_price_usd: Option<f64>,
    /// Enables library logging.
    #[serde(default)]
    pub logging: bool,
    /// Delays and deadlines.
    #[serde(default)]
    pub timings: Timings,
    /// Bundler retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl DrawbridgeConfig {
    /// Configuration with defaults for everything optional.
    #[must_use]
    pub fn new(
        chain_id: u64,
        rpc_url: impl Into<String>,
        bundler_url: impl Into<String>,
        account_factory: AccountFactoryConfig,
    ) -> Self {
        Self {
            chain_id,
            rpc_url: rpc_url.into(),
            bundler_url: bundler_url.into(),
            paymaster_url: None,
            registry_address: None,
            entry_point: ENTRY_POINT_V07,
            account_factory,
            eth_price_usd: None,
            logging: false,
            timings: Timings::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the registry address.
    #[must_use]
    pub fn with_registry(mut self, registry_address: impl Into<String>) -> Self {
        self.registry_address = Some(registry_address.into());
        self
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or fails [`Self::validate`].
    pub fn from_json(json: &str) -> Result<Self, DrawbridgeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every attribute.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::InvalidConfig`] naming the first invalid attribute.
    pub fn validate(&self) -> Result<(), DrawbridgeError> {
        self.registry()?;
        if self.rpc_url.trim().is_empty() {
            return Err(invalid("rpc_url", "must not be empty"));
        }
        if self.bundler_url.trim().is_empty() {
            return Err(invalid("bundler_url", "must not be empty"));
        }
        if let Some(price) = self.eth_price_usd {
            if !price.is_finite() || price <= 0.0 {
                return Err(invalid("eth_price_usd", "must be a positive number"));
            }
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                "must not be lower than retry.base_delay_ms",
            ));
        }
        if self.account_factory.proxy_creation_code.is_empty() {
            return Err(invalid(
                "account_factory.proxy_creation_code",
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// The parsed registry address.
    ///
    /// # Errors
    ///
    /// Returns an error unless the address is `0x` followed by 40 hex digits.
    pub fn registry(&self) -> Result<Option<Address>, DrawbridgeError> {
        self.registry_address
            .as_deref()
            .map(parse_address)
            .transpose()
            .map_err(|reason| invalid("registry_address", &reason))
    }

    /// Fee policy of the configured chain.
    #[must_use]
    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy::for_chain(self.chain_id)
    }

    /// Cost cap applied to session operations, `None` on uncapped chains.
    #[must_use]
    pub fn cost_cap(&self) -> Option<CostCap> {
        self.fee_policy()
            .is_capped()
            .then(|| CostCap::with_eth_price(self.eth_price_usd))
    }
}

fn parse_address(raw: &str) -> Result<Address, String> {
    let hex = raw
        .strip_prefix("0x")
        .ok_or_else(|| format!("{raw} is missing the 0x prefix"))?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("{raw} is not a 20 byte hex address"));
    }
    raw.parse::<Address>().map_err(|err| err.to_string())
}

fn invalid(attribute: &str, reason: &str) -> DrawbridgeError {
    DrawbridgeError::InvalidConfig {
        attribute: attribute.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::defaults::{BASE_CHAIN_ID, LOCAL_CHAIN_ID};
    use test_case::test_case;

    pub(crate) fn factory() -> AccountFactoryConfig {
        AccountFactoryConfig {
            factory: Address::repeat_byte(0xfa),
            implementation: Address::repeat_byte(0x1e),
            proxy_creation_code: Bytes::from(vec![0x60, 0x80, 0x60, 0x40]),
            salt: U256::ZERO,
        }
    }

    #[test_case("0x5FbDB2315678afecb367f032d93F642f64180aa3" ; "checksummed")]
    #[test_case("0x5fbdb2315678afecb367f032d93f642f64180aa3" ; "lowercase")]
    fn test_valid_registry_address(raw: &str) {
        let config = DrawbridgeConfig::new(LOCAL_CHAIN_ID, "http://rpc", "http://bundler", factory())
            .with_registry(raw);
        assert!(config.validate().is_ok());
        assert!(config.registry().unwrap().is_some());
    }

    #[test_case("5fbdb2315678afecb367f032d93f642f64180aa3" ; "missing prefix")]
    #[test_case("0x5fbdb2315678afecb367f032d93f642f64180a" ; "too short")]
    #[test_case("0xzzbdb2315678afecb367f032d93f642f64180aa3" ; "not hex")]
    #[test_case("" ; "empty")]
    fn test_invalid_registry_address(raw: &str) {
        let config = DrawbridgeConfig::new(LOCAL_CHAIN_ID, "http://rpc", "http://bundler", factory())
            .with_registry(raw);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            DrawbridgeError::InvalidConfig { ref attribute, .. } if attribute == "registry_address"
        ));
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = DrawbridgeConfig::from_json(
            r#"{
                "chain_id": 8453,
                "rpc_url": "https://mainnet.base.org",
                "bundler_url": "https://bundler.example",
                "registry_address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
                "account_factory": {
                    "factory": "0x91e60e0613810449d098b0b5ec8b51a0fe8c8985",
                    "implementation": "0x1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e",
                    "proxy_creation_code": "0x6080"
                },
                "retry": { "max_retries": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.entry_point, ENTRY_POINT_V07);
        assert_eq!(config.timings, Timings::default());
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert!(!config.logging);
        assert!(config.cost_cap().is_some());
    }

    #[test]
    fn test_cost_cap_only_on_capped_chains() {
        let local = DrawbridgeConfig::new(LOCAL_CHAIN_ID, "http://rpc", "http://bundler", factory());
        assert!(local.cost_cap().is_none());

        let mut base = DrawbridgeConfig::new(BASE_CHAIN_ID, "http://rpc", "http://bundler", factory());
        base.eth_price_usd = Some(2_500.0);
        assert!(base.validate().is_ok());
        let cap = base.cost_cap().unwrap();
        assert!((cap.eth_price_usd - 2_500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_bad_price() {
        let mut config = DrawbridgeConfig::new(BASE_CHAIN_ID, "http://rpc", "http://bundler", factory());
        config.eth_price_usd = Some(0.0);
        assert!(config.validate().is_err());
    }
}

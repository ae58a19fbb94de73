use thiserror::Error;

use crate::storage::StorageError;

/// Error outputs from `Drawbridge`
#[derive(Debug, Error)]
pub enum DrawbridgeError {
    /// The provided configuration is not valid. Raised at construction time.
    #[error("invalid_config: {attribute}: {reason}")]
    InvalidConfig {
        /// The configuration attribute that failed validation.
        attribute: String,
        /// Explanation of why the attribute is invalid.
        reason: String,
    },
    /// The operation requires a connected wallet and session client.
    #[error("not_connected")]
    NotConnected,
    /// The wallet connector has no connected wallet to hand out.
    #[error("no_connector")]
    NoConnector,
    /// The wallet connector reports the wallet is already connected.
    #[error("already_connected")]
    AlreadyConnected,
    /// The connected wallet is on a different chain than the configured one.
    #[error("chain_mismatch: expected chain {expected}, wallet is on {actual}")]
    ChainMismatch {
        /// The configured chain id.
        expected: u64,
        /// The chain id reported by the wallet.
        actual: u64,
    },
    /// The user rejected a signature or transaction request in their wallet.
    #[error("user_rejected")]
    UserRejected,
    /// Any other failure reported by the user's wallet.
    #[error("wallet_error: {0}")]
    Wallet(String),
    /// A JSON-RPC error object returned by a node, bundler or paymaster.
    #[error("rpc_error ({code}): {message}")]
    Rpc {
        /// The JSON-RPC error code.
        code: i64,
        /// The JSON-RPC error message.
        message: String,
    },
    /// Network connection error with details
    #[error("network_error: {url} (status {status:?}): {error}")]
    NetworkError {
        /// The requested URL.
        url: String,
        /// The HTTP status, if a response was received.
        status: Option<u16>,
        /// The upstream error message.
        error: String,
    },
    /// Unexpected error serializing information
    #[error("serialization_error: {0}")]
    SerializationError(String),
    /// Failure in the session key storage backend.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The account being deployed already has bytecode on-chain.
    #[error("account_already_deployed")]
    AccountAlreadyDeployed,
    /// A concurrent deployment raced the delegation registration.
    #[error("deployment_conflict: the account was deployed concurrently, please try again")]
    DeploymentConflict,
    /// The session account could not be deployed.
    #[error("deployment_failed: {0}")]
    DeploymentFailed(String),
    /// A user operation was included but did not succeed.
    #[error("user_operation_failed: {hash}: {reason}")]
    UserOperationFailed {
        /// The user operation hash.
        hash: String,
        /// The revert reason reported by the bundler.
        reason: String,
    },
    /// A transaction was mined but reverted.
    #[error("transaction_reverted: {hash}")]
    TransactionReverted {
        /// The transaction hash.
        hash: String,
    },
    /// An operation did not complete before its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Generic error with a message.
    #[error("generic_error: {0}")]
    Generic(String),
}

impl DrawbridgeError {
    /// Returns the human readable message carried by the error, used for substring
    /// matching of upstream bundler and factory errors.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Rpc { message, .. } => message.clone(),
            Self::NetworkError { error, .. } => error.clone(),
            Self::UserOperationFailed { reason, .. } => reason.clone(),
            Self::Wallet(message)
            | Self::DeploymentFailed(message)
            | Self::Generic(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for DrawbridgeError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

impl From<alloy::signers::Error> for DrawbridgeError {
    fn from(error: alloy::signers::Error) -> Self {
        Self::Generic(format!("signer error: {error}"))
    }
}

impl From<alloy::sol_types::Error> for DrawbridgeError {
    fn from(error: alloy::sol_types::Error) -> Self {
        Self::SerializationError(format!("abi error: {error}"))
    }
}

impl From<reqwest::Error> for DrawbridgeError {
    fn from(error: reqwest::Error) -> Self {
        Self::NetworkError {
            url: error
                .url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            status: error.status().map(|status| status.as_u16()),
            error: error.to_string(),
        }
    }
}

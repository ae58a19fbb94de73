//! Chain presets and protocol constants.

use alloy::primitives::{address, b256, Address, B256};

/// Chain id of a local development node (anvil, hardhat).
pub const LOCAL_CHAIN_ID: u64 = 31337;

/// Redstone mainnet.
pub const REDSTONE_CHAIN_ID: u64 = 690;

/// Base mainnet.
pub const BASE_CHAIN_ID: u64 = 8453;

/// Production chains whose bundlers enforce a minimum priority fee and where
/// user operation costs are capped.
pub const FEE_CAPPED_CHAIN_IDS: [u64; 2] = [REDSTONE_CHAIN_ID, BASE_CHAIN_ID];

/// ERC-4337 v0.7 entry point, deployed at the same address on every chain.
pub static ENTRY_POINT_V07: Address = address!("0x0000000071727De22E5E9d8BAf0edAc6f37da032");

/// Trailing magic bytes of an ERC-6492 wrapped signature.
pub const ERC6492_MAGIC: B256 =
    b256!("0x6492649264926492649264926492649264926492649264926492649264926492");

/// Minimum priority fee accepted by bundlers on fee-capped chains (0.001 gwei).
pub const MIN_PRIORITY_FEE_PER_GAS: u128 = 1_000_000;

/// Ceiling for `maxFeePerGas` on fee-capped chains (0.1 gwei).
pub const MAX_FEE_PER_GAS_CAP: u128 = 100_000_000;

/// `maxFeePerGas` used when the network fee estimate is unavailable (0.01 gwei).
pub const FALLBACK_MAX_FEE_PER_GAS: u128 = 10_000_000;

/// `maxPriorityFeePerGas` used when the network fee estimate is unavailable.
pub const FALLBACK_MAX_PRIORITY_FEE_PER_GAS: u128 = MIN_PRIORITY_FEE_PER_GAS;

/// Upper bound for the cost of a single user operation, in USD.
pub const MAX_USER_OPERATION_COST_USD: f64 = 0.10;

/// ETH/USD price assumed when the configuration does not provide one.
pub const DEFAULT_ETH_PRICE_USD: f64 = 4_000.0;

/// Multiplier applied to the ETH/USD price before computing the fee ceiling.
pub const COST_SAFETY_MARGIN: f64 = 1.2;

/// Storage key holding the serialized session signer map.
pub const SESSION_SIGNERS_STORAGE_KEY: &str = "drawbridge:session-signers";

/// Storage key used by the previous product name for the signer map.
pub const LEGACY_SESSION_SIGNERS_STORAGE_KEY: &str = "entrykit:session-signers";

/// Prefix of the per-user legacy key location, followed by the lowercased address.
pub const LEGACY_SIGNER_KEY_PREFIX: &str = "mud:appSigner:";

/// Initial delay between retries of rate-limited bundler requests.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Maximum delay between retries of rate-limited bundler requests.
pub const RETRY_MAX_DELAY_MS: u64 = 8_000;

/// Maximum number of retries for a bundler request (total attempts = retries + 1).
pub const RETRY_MAX_RETRIES: usize = 3;

/// Time given to the bundler to observe a freshly deployed wallet.
pub const DEPLOYMENT_SETTLE_DELAY_MS: u64 = 2_000;

/// Deadline for the session account deployment user operation.
pub const SESSION_DEPLOYMENT_TIMEOUT_MS: u64 = 60_000;

/// Deadline for receipts of delegation user operations and transactions.
pub const RECEIPT_TIMEOUT_MS: u64 = 120_000;

/// Interval between receipt polls.
pub const RECEIPT_POLL_INTERVAL_MS: u64 = 1_000;

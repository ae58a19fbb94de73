//! ERC-4337 v0.7 user operations and bundler response types.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::SolValue;
use serde::{Deserialize, Serialize};

/// A single call executed by a smart account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Call target.
    pub to: Address,
    /// Wei attached to the call.
    pub value: U256,
    /// Calldata.
    pub data: Bytes,
}

impl Execution {
    /// A call without value.
    #[must_use]
    pub const fn new(to: Address, data: Bytes) -> Self {
        Self {
            to,
            value: U256::ZERO,
            data,
        }
    }
}

/// Unpacked v0.7 user operation, in the JSON shape bundlers expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
}

impl UserOperation {
    /// Sum of every gas limit the operation may consume, paymaster included.
    #[must_use]
    pub fn total_gas(&self) -> U256 {
        self.call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas)
            .saturating_add(self.paymaster_verification_gas_limit.unwrap_or_default())
            .saturating_add(self.paymaster_post_op_gas_limit.unwrap_or_default())
    }

    /// `factory ‖ factoryData`, empty when the sender is already deployed.
    #[must_use]
    pub fn init_code(&self) -> Bytes {
        self.factory.map_or_else(Bytes::new, |factory| {
            let mut code = factory.to_vec();
            if let Some(data) = &self.factory_data {
                code.extend_from_slice(data);
            }
            code.into()
        })
    }

    /// `paymaster ‖ uint128(verificationGas) ‖ uint128(postOpGas) ‖ paymasterData`.
    #[must_use]
    pub fn paymaster_and_data(&self) -> Bytes {
        self.paymaster.map_or_else(Bytes::new, |paymaster| {
            let mut out = paymaster.to_vec();
            out.extend_from_slice(&as_u128(self.paymaster_verification_gas_limit).to_be_bytes());
            out.extend_from_slice(&as_u128(self.paymaster_post_op_gas_limit).to_be_bytes());
            if let Some(data) = &self.paymaster_data {
                out.extend_from_slice(data);
            }
            out.into()
        })
    }

    /// The hash signed by the sender, binding the packed operation to the entry
    /// point and chain.
    #[must_use]
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let account_gas_limits = pack_u128_pair(self.verification_gas_limit, self.call_gas_limit);
        let gas_fees = pack_u128_pair(self.max_priority_fee_per_gas, self.max_fee_per_gas);
        let packed = (
            self.sender,
            self.nonce,
            keccak256(self.init_code()),
            keccak256(&self.call_data),
            account_gas_limits,
            self.pre_verification_gas,
            gas_fees,
            keccak256(self.paymaster_and_data()),
        )
            .abi_encode();
        keccak256((keccak256(packed), entry_point, U256::from(chain_id)).abi_encode())
    }
}

fn as_u128(value: Option<U256>) -> u128 {
    value.unwrap_or_default().saturating_to::<u128>()
}

fn pack_u128_pair(high: U256, low: U256) -> B256 {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&high.saturating_to::<u128>().to_be_bytes());
    out[16..].copy_from_slice(&low.saturating_to::<u128>().to_be_bytes());
    B256::from(out)
}

/// Placeholder ECDSA signature with the length and shape of a real one, used
/// while estimating gas before the operation is signed.
#[must_use]
pub fn dummy_signature() -> Bytes {
    let mut sig = Vec::with_capacity(65);
    sig.extend_from_slice(&[0xff; 15]);
    sig.push(0xf0);
    sig.extend_from_slice(&[0x00; 16]);
    sig.push(0x7a);
    sig.extend_from_slice(&[0xaa; 31]);
    sig.push(0x1c);
    sig.into()
}

/// Result of `eth_estimateUserOperationGas`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct UserOperationGasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// Result of `eth_getUserOperationReceipt`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    /// Hash of the user operation.
    pub user_op_hash: B256,
    /// Whether the operation's execution succeeded.
    pub success: bool,
    /// Revert reason, if any.
    #[serde(default)]
    pub reason: Option<String>,
    /// The transaction that included the operation.
    pub receipt: IncludedTransaction,
}

/// The bundle transaction carrying a user operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludedTransaction {
    /// Transaction hash of the bundle.
    pub transaction_hash: B256,
}

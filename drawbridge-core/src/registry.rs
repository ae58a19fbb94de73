//! Delegation registry bindings.
//!
//! The registry is a MUD world: systems and tables are addressed by 32 byte
//! resource ids, delegations live in the `UserDelegationControl` table and
//! signed calls are replay protected by a per-signer nonce table.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{Eip712Domain, SolCall, SolStruct};
use serde_json::{json, Value};

use crate::chain::ChainClient;
use crate::error::DrawbridgeError;

#[allow(missing_docs)]
mod bindings {
    use alloy::sol;

    sol! {
        /// EIP-712 message authorizing a call on behalf of `signer`.
        struct Call {
            address signer;
            string systemNamespace;
            string systemName;
            bytes callData;
            uint256 nonce;
        }

        /// Registry entry points used by the session core.
        interface IWorld {
            function registerDelegation(address delegatee, bytes32 delegationControlId, bytes initCallData) external;
            function callWithSignature(address signer, bytes32 systemId, bytes callData, bytes signature) external payable returns (bytes memory);
            function callFrom(address delegator, bytes32 systemId, bytes callData) external payable returns (bytes memory);
            function getStaticField(bytes32 tableId, bytes32[] keyTuple, uint8 fieldIndex, bytes32 fieldLayout) external view returns (bytes32);
        }
    }
}

pub use bindings::{Call, IWorld};

const SYSTEM_TYPE: [u8; 2] = *b"sy";
const TABLE_TYPE: [u8; 2] = *b"tb";
const NAMESPACE_LEN: usize = 14;
const NAME_LEN: usize = 16;

/// Layout of a table with a single 32 byte static field.
const SINGLE_WORD_FIELD_LAYOUT: B256 = {
    let mut layout = [0u8; 32];
    layout[1] = 0x20;
    layout[2] = 0x01;
    layout[4] = 0x20;
    B256::new(layout)
};

/// A MUD resource id: `type (2) ‖ namespace (14) ‖ name (16)`, zero padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(B256);

impl ResourceId {
    /// Builds an id, truncating namespace and name to their field widths.
    #[must_use]
    pub fn new(kind: [u8; 2], namespace: &str, name: &str) -> Self {
        let mut id = [0u8; 32];
        id[..2].copy_from_slice(&kind);
        let namespace = &namespace.as_bytes()[..namespace.len().min(NAMESPACE_LEN)];
        id[2..2 + namespace.len()].copy_from_slice(namespace);
        let name = &name.as_bytes()[..name.len().min(NAME_LEN)];
        id[16..16 + name.len()].copy_from_slice(name);
        Self(B256::new(id))
    }

    /// A system id.
    #[must_use]
    pub fn system(namespace: &str, name: &str) -> Self {
        Self::new(SYSTEM_TYPE, namespace, name)
    }

    /// A table id.
    #[must_use]
    pub fn table(namespace: &str, name: &str) -> Self {
        Self::new(TABLE_TYPE, namespace, name)
    }

    /// Raw 32 byte id.
    #[must_use]
    pub const fn id(&self) -> B256 {
        self.0
    }

    /// Namespace, without padding.
    #[must_use]
    pub fn namespace(&self) -> String {
        unpad(&self.0[2..16])
    }

    /// Name, without padding.
    #[must_use]
    pub fn name(&self) -> String {
        unpad(&self.0[16..])
    }
}

impl From<ResourceId> for B256 {
    fn from(value: ResourceId) -> Self {
        value.0
    }
}

fn unpad(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Delegation control granting the delegatee full access.
#[must_use]
pub fn unlimited_delegation() -> ResourceId {
    ResourceId::system("", "unlimited")
}

/// The root system exposing `registerDelegation`.
#[must_use]
pub fn registration_system() -> ResourceId {
    ResourceId::system("", "Registration")
}

fn user_delegation_control_table() -> ResourceId {
    ResourceId::table("world", "UserDelegationControl")
}

fn call_with_signature_nonces_table() -> ResourceId {
    ResourceId::table("", "CallWithSignatureNonces")
}

fn address_key(address: Address) -> B256 {
    address.into_word()
}

/// Handle on a deployed delegation registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registry {
    address: Address,
}

impl Registry {
    /// Registry at `address`.
    #[must_use]
    pub const fn new(address: Address) -> Self {
        Self { address }
    }

    /// Registry address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Whether `delegator` granted `delegatee` unlimited delegation.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn has_delegation(
        &self,
        chain: &dyn ChainClient,
        delegator: Address,
        delegatee: Address,
    ) -> Result<bool, DrawbridgeError> {
        let control_id = self
            .read_word(
                chain,
                user_delegation_control_table(),
                vec![address_key(delegator), address_key(delegatee)],
            )
            .await?;
        Ok(control_id == unlimited_delegation().id())
    }

    /// Next `callWithSignature` nonce of `signer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn call_with_signature_nonce(
        &self,
        chain: &dyn ChainClient,
        signer: Address,
    ) -> Result<U256, DrawbridgeError> {
        let word = self
            .read_word(
                chain,
                call_with_signature_nonces_table(),
                vec![address_key(signer)],
            )
            .await?;
        Ok(U256::from_be_bytes(word.0))
    }

    async fn read_word(
        &self,
        chain: &dyn ChainClient,
        table: ResourceId,
        key_tuple: Vec<B256>,
    ) -> Result<B256, DrawbridgeError> {
        let call = IWorld::getStaticFieldCall {
            tableId: table.id(),
            keyTuple: key_tuple,
            fieldIndex: 0,
            fieldLayout: SINGLE_WORD_FIELD_LAYOUT,
        };
        let output = chain.call(self.address, call.abi_encode().into()).await?;
        Ok(IWorld::getStaticFieldCall::abi_decode_returns(&output)?)
    }

    /// EIP-712 domain of signed calls on `chain_id`.
    #[must_use]
    pub fn eip712_domain(&self, chain_id: u64) -> Eip712Domain {
        Eip712Domain::new(
            None,
            None,
            None,
            Some(self.address),
            Some(B256::from(U256::from(chain_id))),
        )
    }

    /// `registerDelegation(delegatee, UNLIMITED, "")` calldata.
    #[must_use]
    pub fn register_delegation_calldata(delegatee: Address) -> Bytes {
        IWorld::registerDelegationCall {
            delegatee,
            delegationControlId: unlimited_delegation().id(),
            initCallData: Bytes::new(),
        }
        .abi_encode()
        .into()
    }

    /// `callWithSignature(signer, system, call_data, signature)` calldata.
    #[must_use]
    pub fn call_with_signature_calldata(
        signer: Address,
        system: ResourceId,
        call_data: Bytes,
        signature: Bytes,
    ) -> Bytes {
        IWorld::callWithSignatureCall {
            signer,
            systemId: system.id(),
            callData: call_data,
            signature,
        }
        .abi_encode()
        .into()
    }

    /// `callFrom(delegator, system, call_data)` calldata.
    #[must_use]
    pub fn call_from_calldata(delegator: Address, system: ResourceId, call_data: Bytes) -> Bytes {
        IWorld::callFromCall {
            delegator,
            systemId: system.id(),
            callData: call_data,
        }
        .abi_encode()
        .into()
    }

    /// Typed `Call` message for `signer`.
    #[must_use]
    pub fn typed_call(
        &self,
        chain_id: u64,
        signer: Address,
        system: ResourceId,
        call_data: Bytes,
        nonce: U256,
    ) -> TypedCall {
        TypedCall {
            domain: self.eip712_domain(chain_id),
            message: Call {
                signer,
                systemNamespace: system.namespace(),
                systemName: system.name(),
                callData: call_data,
                nonce,
            },
        }
    }
}

/// A `Call` message together with its signing domain.
#[derive(Clone)]
pub struct TypedCall {
    /// Signing domain.
    pub domain: Eip712Domain,
    /// Message.
    pub message: Call,
}

impl std::fmt::Debug for TypedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCall")
            .field("signer", &self.message.signer)
            .field("system_namespace", &self.message.systemNamespace)
            .field("system_name", &self.message.systemName)
            .field("nonce", &self.message.nonce)
            .finish_non_exhaustive()
    }
}

impl TypedCall {
    /// EIP-712 signing hash.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        self.message.eip712_signing_hash(&self.domain)
    }

    /// `eth_signTypedData_v4` payload.
    #[must_use]
    pub fn to_typed_data_json(&self) -> Value {
        json!({
            "types": {
                "EIP712Domain": [
                    { "name": "verifyingContract", "type": "address" },
                    { "name": "salt", "type": "bytes32" },
                ],
                "Call": [
                    { "name": "signer", "type": "address" },
                    { "name": "systemNamespace", "type": "string" },
                    { "name": "systemName", "type": "string" },
                    { "name": "callData", "type": "bytes" },
                    { "name": "nonce", "type": "uint256" },
                ],
            },
            "primaryType": "Call",
            "domain": {
                "verifyingContract": self.domain.verifying_contract,
                "salt": self.domain.salt,
            },
            "message": {
                "signer": self.message.signer,
                "systemNamespace": self.message.systemNamespace,
                "systemName": self.message.systemName,
                "callData": self.message.callData,
                "nonce": self.message.nonce.to_string(),
            },
        })
    }
}

//! Session smart accounts.
//!
//! A session account is a `SimpleAccount` owned by the session signer and deployed
//! through a CREATE2 factory. Its address is known before deployment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::{SolCall, SolValue};

use crate::chain::ChainClient;
use crate::config::AccountFactoryConfig;
use crate::error::DrawbridgeError;
use crate::signer::SessionSignerProvider;
use crate::user_operation::{Execution, UserOperation};
use crate::wallet::AccountDescriptor;

#[allow(missing_docs)]
mod bindings {
    use alloy::sol;

    sol! {
        interface ISimpleAccount {
            function initialize(address anOwner) external;
            function execute(address dest, uint256 value, bytes func) external;
            function executeBatch(address[] dest, uint256[] value, bytes[] func) external;
        }

        interface ISimpleAccountFactory {
            function createAccount(address owner, uint256 salt) external returns (address);
        }
    }
}

pub use bindings::{ISimpleAccount, ISimpleAccountFactory};

/// Counterfactual address of the account `factory` deploys for `owner`.
#[must_use]
pub fn session_account_address(factory: &AccountFactoryConfig, owner: Address) -> Address {
    let initialize: Bytes = ISimpleAccount::initializeCall { anOwner: owner }
        .abi_encode()
        .into();
    let mut init_code = factory.proxy_creation_code.to_vec();
    init_code.extend_from_slice(&(factory.implementation, initialize).abi_encode_params());
    factory
        .factory
        .create2(B256::from(factory.salt), keccak256(init_code))
}

/// A session account owned by a local signer.
pub struct SessionAccount {
    address: Address,
    signer: PrivateKeySigner,
    factory: AccountFactoryConfig,
    entry_point: Address,
    chain_id: u64,
    chain: Arc<dyn ChainClient>,
    deployed: AtomicBool,
}

impl std::fmt::Debug for SessionAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAccount")
            .field("address", &self.address)
            .field("owner", &self.signer.address())
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl SessionAccount {
    /// Binds `signer` to its counterfactual account on `chain`.
    #[must_use]
    pub fn new(
        signer: PrivateKeySigner,
        factory: AccountFactoryConfig,
        entry_point: Address,
        chain_id: u64,
        chain: Arc<dyn ChainClient>,
    ) -> Self {
        let address = session_account_address(&factory, signer.address());
        Self {
            address,
            signer,
            factory,
            entry_point,
            chain_id,
            chain,
            deployed: AtomicBool::new(false),
        }
    }

    /// Account address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The session signer owning the account.
    #[must_use]
    pub const fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// Entry point the account validates operations against.
    #[must_use]
    pub const fn entry_point(&self) -> Address {
        self.entry_point
    }

    /// Chain the account lives on.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Chain client the account reads through.
    #[must_use]
    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    /// Whether the account has bytecode. A positive answer is cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be read.
    pub async fn is_deployed(&self) -> Result<bool, DrawbridgeError> {
        if self.deployed.load(Ordering::Acquire) {
            return Ok(true);
        }
        let deployed = !self.chain.get_code(self.address).await?.is_empty();
        if deployed {
            self.deployed.store(true, Ordering::Release);
        }
        Ok(deployed)
    }

    /// Factory address and `createAccount` calldata deploying this account.
    #[must_use]
    pub fn factory_args(&self) -> (Address, Bytes) {
        let data = ISimpleAccountFactory::createAccountCall {
            owner: self.signer.address(),
            salt: self.factory.salt,
        }
        .abi_encode();
        (self.factory.factory, data.into())
    }

    /// Descriptor of the account, with deployment data while undeployed.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be read.
    pub async fn descriptor(&self) -> Result<AccountDescriptor, DrawbridgeError> {
        if self.is_deployed().await? {
            return Ok(AccountDescriptor::deployed(self.address));
        }
        let (factory, factory_data) = self.factory_args();
        Ok(AccountDescriptor {
            address: self.address,
            factory: Some(factory),
            factory_data: Some(factory_data),
        })
    }

    /// Account calldata executing `calls`: `execute` for one call, `executeBatch` otherwise.
    #[must_use]
    pub fn encode_calls(calls: &[Execution]) -> Bytes {
        if let [call] = calls {
            return ISimpleAccount::executeCall {
                dest: call.to,
                value: call.value,
                func: call.data.clone(),
            }
            .abi_encode()
            .into();
        }
        ISimpleAccount::executeBatchCall {
            dest: calls.iter().map(|call| call.to).collect(),
            value: calls.iter().map(|call| call.value).collect(),
            func: calls.iter().map(|call| call.data.clone()).collect(),
        }
        .abi_encode()
        .into()
    }

    /// Signs the operation hash with an EIP-191 personal signature.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign_user_operation(&self, op: &UserOperation) -> Result<Bytes, DrawbridgeError> {
        let hash = op.hash(self.entry_point, self.chain_id);
        let signature = self.signer.sign_message_sync(hash.as_slice())?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }

    /// A call without value or data, used to force deployment.
    #[must_use]
    pub fn noop_call() -> Execution {
        Execution {
            to: Address::ZERO,
            value: U256::ZERO,
            data: Bytes::new(),
        }
    }
}

/// Session account and the signer owning it.
#[derive(Debug, Clone)]
pub struct ProvisionedSession {
    /// The session account.
    pub account: Arc<SessionAccount>,
    /// Its owner.
    pub signer: PrivateKeySigner,
}

/// Builds session accounts for connecting users.
#[derive(Debug)]
pub struct SessionAccountProvisioner {
    signers: Arc<SessionSignerProvider>,
    factory: AccountFactoryConfig,
    entry_point: Address,
    chain_id: u64,
}

impl SessionAccountProvisioner {
    /// Creates a provisioner for accounts deployed by `factory`.
    #[must_use]
    pub const fn new(
        signers: Arc<SessionSignerProvider>,
        factory: AccountFactoryConfig,
        entry_point: Address,
        chain_id: u64,
    ) -> Self {
        Self {
            signers,
            factory,
            entry_point,
            chain_id,
        }
    }

    /// Session account of `user` on `chain`.
    #[must_use]
    pub fn provision(&self, chain: Arc<dyn ChainClient>, user: Address) -> ProvisionedSession {
        let signer = self.signers.signer_for(user);
        let account = SessionAccount::new(
            signer.clone(),
            self.factory.clone(),
            self.entry_point,
            self.chain_id,
            chain,
        );
        log::debug!(
            "session account for {user} is {} (signer {})",
            account.address(),
            signer.address()
        );
        ProvisionedSession {
            account: Arc::new(account),
            signer,
        }
    }
}

#![allow(dead_code, missing_docs)]

//! In-memory chain, bundler, wallet and connector shared by the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;
use drawbridge_core::account::{ISimpleAccount, SessionAccountProvisioner};
use drawbridge_core::bundler::{Bundler, GasSponsor, SponsorData};
use drawbridge_core::chain::{ChainClient, TransactionOutcome};
use drawbridge_core::config::{AccountFactoryConfig, Timings};
use drawbridge_core::deployment::Erc6492Signature;
use drawbridge_core::fees::FeeEstimate;
use drawbridge_core::registry::{unlimited_delegation, IWorld, Registry, ResourceId, TypedCall};
use drawbridge_core::session_client::SessionClientBuilder;
use drawbridge_core::signer::SessionSignerProvider;
use drawbridge_core::storage::{KeyStore, KeyValueStore, MemoryStore};
use drawbridge_core::transport::CostCap;
use drawbridge_core::user_operation::{
    Execution, IncludedTransaction, UserOperation, UserOperationGasEstimate,
    UserOperationReceipt,
};
use drawbridge_core::wallet::AccountDescriptor;
use drawbridge_core::{
    AccountKind, ConnectionState, ConnectionStatus, Drawbridge, DrawbridgeConfig,
    DrawbridgeError, WalletClient, WalletConnector,
};
use tokio::sync::{watch, Notify};

mod bindings {
    use alloy::sol;

    sol! {
        interface IEntryPoint {
            function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
        }
    }
}

use bindings::IEntryPoint;

pub const CHAIN_ID: u64 = 31337;
pub const REGISTRY: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

pub fn registry_address() -> Address {
    REGISTRY.parse().unwrap()
}

pub fn config() -> DrawbridgeConfig {
    let factory = AccountFactoryConfig {
        factory: Address::repeat_byte(0xfa),
        implementation: Address::repeat_byte(0x1e),
        proxy_creation_code: Bytes::from(vec![0x60, 0x80, 0x60, 0x40]),
        salt: U256::ZERO,
    };
    let mut config = DrawbridgeConfig::new(
        CHAIN_ID,
        "http://127.0.0.1:8545",
        "http://127.0.0.1:4337",
        factory,
    )
    .with_registry(REGISTRY);
    config.timings = Timings {
        settle_delay_ms: 5,
        deployment_timeout_ms: 1_000,
        receipt_poll_interval_ms: 5,
        receipt_timeout_ms: 1_000,
    };
    config
}

/// Session client builder for `user` on the fake chain, with a fresh session key.
pub fn session_client(
    config: &DrawbridgeConfig,
    chain: &Arc<FakeChain>,
    bundler: Arc<dyn Bundler>,
    user: Address,
) -> SessionClientBuilder {
    let key_store = Arc::new(KeyStore::new(Arc::new(MemoryStore::new())));
    let provisioner = SessionAccountProvisioner::new(
        Arc::new(SessionSignerProvider::new(key_store)),
        config.account_factory.clone(),
        config.entry_point,
        config.chain_id,
    );
    let session = provisioner.provision(chain.clone(), user);
    SessionClientBuilder::new(session.account, user, bundler)
        .registry(config.registry().unwrap().map(Registry::new))
        .timings(config.timings)
}

/// Holds a fake call once armed, until the test releases it.
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once an armed call is waiting.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

/// Chain state: deployed code, registered delegations and entry point nonces.
#[derive(Default)]
pub struct FakeChain {
    code: Mutex<HashSet<Address>>,
    deployments: Mutex<HashMap<Address, usize>>,
    delegations: Mutex<HashSet<(Address, Address)>>,
    factories: Mutex<HashMap<Address, Address>>,
    nonces: Mutex<HashMap<Address, u64>>,
    fees: Mutex<Option<FeeEstimate>>,
    fail_fee_estimates: AtomicBool,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Network fee estimate returned from now on.
    pub fn set_fees(&self, fees: FeeEstimate) {
        *self.fees.lock().unwrap() = Some(fees);
    }

    pub fn fail_fee_estimates(&self) {
        self.fail_fee_estimates.store(true, Ordering::SeqCst);
    }

    pub fn deploy(&self, address: Address) {
        if self.code.lock().unwrap().insert(address) {
            *self.deployments.lock().unwrap().entry(address).or_default() += 1;
        }
    }

    pub fn is_deployed(&self, address: Address) -> bool {
        self.code.lock().unwrap().contains(&address)
    }

    pub fn deployments_of(&self, address: Address) -> usize {
        self.deployments
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Calls to `factory` deploy `account`.
    pub fn add_factory(&self, factory: Address, account: Address) {
        self.factories.lock().unwrap().insert(factory, account);
    }

    pub fn factory_target(&self, factory: Address) -> Option<Address> {
        self.factories.lock().unwrap().get(&factory).copied()
    }

    pub fn register_delegation(&self, delegator: Address, delegatee: Address) {
        self.delegations
            .lock()
            .unwrap()
            .insert((delegator, delegatee));
    }

    pub fn has_delegation(&self, delegator: Address, delegatee: Address) -> bool {
        self.delegations
            .lock()
            .unwrap()
            .contains(&(delegator, delegatee))
    }

    pub fn delegation_count(&self) -> usize {
        self.delegations.lock().unwrap().len()
    }

    fn bump_nonce(&self, sender: Address) {
        *self.nonces.lock().unwrap().entry(sender).or_default() += 1;
    }

    /// Applies a registry call made by `caller`.
    fn apply_registry_call(&self, caller: Address, data: &[u8]) {
        if let Ok(call) = IWorld::registerDelegationCall::abi_decode(data) {
            self.register_delegation(caller, call.delegatee);
        } else if let Ok(call) = IWorld::callWithSignatureCall::abi_decode(data) {
            if let Ok(inner) = IWorld::registerDelegationCall::abi_decode(&call.callData) {
                self.register_delegation(call.signer, inner.delegatee);
            }
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn chain_id(&self) -> Result<u64, DrawbridgeError> {
        Ok(CHAIN_ID)
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, DrawbridgeError> {
        if self.is_deployed(address) {
            Ok(Bytes::from(vec![0x60, 0x80]))
        } else {
            Ok(Bytes::new())
        }
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes, DrawbridgeError> {
        if data.starts_with(&IEntryPoint::getNonceCall::SELECTOR) {
            let call = IEntryPoint::getNonceCall::abi_decode(&data)?;
            let nonce = self
                .nonces
                .lock()
                .unwrap()
                .get(&call.sender)
                .copied()
                .unwrap_or_default();
            return Ok(U256::from(nonce).abi_encode().into());
        }
        if data.starts_with(&IWorld::getStaticFieldCall::SELECTOR) {
            let call = IWorld::getStaticFieldCall::abi_decode(&data)?;
            let delegations = ResourceId::table("world", "UserDelegationControl").id();
            let word = match call.keyTuple.as_slice() {
                [delegator, delegatee] if call.tableId == delegations => {
                    if self.has_delegation(
                        Address::from_word(*delegator),
                        Address::from_word(*delegatee),
                    ) {
                        unlimited_delegation().id()
                    } else {
                        B256::ZERO
                    }
                }
                _ => B256::ZERO,
            };
            return Ok(word.abi_encode().into());
        }
        Err(DrawbridgeError::Generic("unexpected eth_call".to_string()))
    }

    async fn estimate_eip1559_fees(&self) -> Result<FeeEstimate, DrawbridgeError> {
        if self.fail_fee_estimates.load(Ordering::SeqCst) {
            return Err(DrawbridgeError::Rpc {
                code: -32601,
                message: "eth_maxPriorityFeePerGas not supported".to_string(),
            });
        }
        Ok(self
            .fees
            .lock()
            .unwrap()
            .unwrap_or_else(|| FeeEstimate::new(2_000_000, 1_000_000)))
    }

    async fn wait_for_transaction_receipt(
        &self,
        hash: B256,
        _timeout: Duration,
    ) -> Result<TransactionOutcome, DrawbridgeError> {
        Ok(TransactionOutcome {
            hash,
            success: true,
        })
    }
}

/// When a sent operation takes effect and gets a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    /// Included with a receipt right away.
    Instant,
    /// Included, but the receipt never shows up.
    Late,
    /// Accepted and then dropped.
    Never,
}

/// Bundler that includes every operation immediately, unless told otherwise.
pub struct FakeBundler {
    chain: Arc<FakeChain>,
    sent: Mutex<Vec<UserOperation>>,
    receipts: Mutex<HashMap<B256, UserOperationReceipt>>,
    inclusion: Mutex<Inclusion>,
    already_constructed_next: AtomicBool,
    cost_cap: Option<CostCap>,
}

impl FakeBundler {
    pub fn new(chain: Arc<FakeChain>) -> Arc<Self> {
        Arc::new(Self::build(chain, None))
    }

    /// A bundler enforcing `cap` on the operations it prepares.
    pub fn capped(chain: Arc<FakeChain>, cap: CostCap) -> Arc<Self> {
        Arc::new(Self::build(chain, Some(cap)))
    }

    fn build(chain: Arc<FakeChain>, cost_cap: Option<CostCap>) -> Self {
        Self {
            chain,
            sent: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            inclusion: Mutex::new(Inclusion::Instant),
            already_constructed_next: AtomicBool::new(false),
            cost_cap,
        }
    }

    pub fn set_inclusion(&self, inclusion: Inclusion) {
        *self.inclusion.lock().unwrap() = inclusion;
    }

    /// The next send fails validation as if its sender had been deployed meanwhile.
    pub fn reject_next_as_already_constructed(&self) {
        self.already_constructed_next.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<UserOperation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn insert_receipt(&self, hash: B256, success: bool) {
        self.receipts.lock().unwrap().insert(
            hash,
            UserOperationReceipt {
                user_op_hash: hash,
                success,
                reason: (!success).then(|| "execution reverted".to_string()),
                receipt: IncludedTransaction {
                    transaction_hash: keccak256(hash),
                },
            },
        );
    }

    fn executions(call_data: &[u8]) -> Vec<Execution> {
        if let Ok(call) = ISimpleAccount::executeCall::abi_decode(call_data) {
            return vec![Execution {
                to: call.dest,
                value: call.value,
                data: call.func,
            }];
        }
        if let Ok(call) = ISimpleAccount::executeBatchCall::abi_decode(call_data) {
            return call
                .dest
                .into_iter()
                .zip(call.func)
                .map(|(to, data)| Execution::new(to, data))
                .collect();
        }
        Vec::new()
    }
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn estimate_user_operation_gas(
        &self,
        _op: &UserOperation,
        _entry_point: Address,
    ) -> Result<UserOperationGasEstimate, DrawbridgeError> {
        Ok(UserOperationGasEstimate {
            pre_verification_gas: U256::from(50_000),
            verification_gas_limit: U256::from(300_000),
            call_gas_limit: U256::from(200_000),
            ..Default::default()
        })
    }

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<B256, DrawbridgeError> {
        if self.already_constructed_next.swap(false, Ordering::SeqCst) {
            return Err(DrawbridgeError::Rpc {
                code: -32500,
                message: "AA10 sender already constructed".to_string(),
            });
        }
        let inclusion = *self.inclusion.lock().unwrap();
        let hash = op.hash(entry_point, CHAIN_ID);
        if inclusion == Inclusion::Never {
            self.sent.lock().unwrap().push(op.clone());
            return Ok(hash);
        }
        if op.factory.is_some() {
            if self.chain.is_deployed(op.sender) {
                return Err(DrawbridgeError::Rpc {
                    code: -32500,
                    message: "AA10 sender already constructed".to_string(),
                });
            }
            self.chain.deploy(op.sender);
        }
        for call in Self::executions(&op.call_data) {
            if let Some(account) = self.chain.factory_target(call.to) {
                self.chain.deploy(account);
            }
            self.chain.apply_registry_call(op.sender, &call.data);
        }
        self.chain.bump_nonce(op.sender);
        self.sent.lock().unwrap().push(op.clone());

        if inclusion == Inclusion::Instant {
            self.insert_receipt(hash, true);
        }
        Ok(hash)
    }

    async fn get_user_operation_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<UserOperationReceipt>, DrawbridgeError> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    fn cap_user_operation(&self, op: &mut UserOperation) -> bool {
        self.cost_cap.is_some_and(|cap| cap.apply(op))
    }
}

/// Sponsor whose final paymaster data asks for more gas than its stub.
pub struct FakeSponsor {
    pub paymaster: Address,
    pub stub_gas: (u64, u64),
    pub final_gas: (u64, u64),
}

impl FakeSponsor {
    fn data(&self, (verification, post_op): (u64, u64)) -> SponsorData {
        SponsorData {
            paymaster: self.paymaster,
            paymaster_data: Bytes::from(vec![0x01]),
            paymaster_verification_gas_limit: Some(U256::from(verification)),
            paymaster_post_op_gas_limit: Some(U256::from(post_op)),
        }
    }
}

#[async_trait]
impl GasSponsor for FakeSponsor {
    async fn stub_data(
        &self,
        _op: &UserOperation,
        _entry_point: Address,
        _chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError> {
        Ok(self.data(self.stub_gas))
    }

    async fn sponsor_data(
        &self,
        _op: &UserOperation,
        _entry_point: Address,
        _chain_id: u64,
    ) -> Result<SponsorData, DrawbridgeError> {
        Ok(self.data(self.final_gas))
    }
}

/// A user's wallet. Smart wallets start counterfactual.
pub struct FakeWallet {
    address: Address,
    chain_id: u64,
    kind: AccountKind,
    factory: Address,
    erc6492: bool,
    reject_next: AtomicBool,
    revert_next: AtomicBool,
    next_hash: AtomicU8,
    /// Holds the next `chain_id` call.
    pub chain_id_gate: Gate,
    /// Holds the next typed data signature.
    pub sign_gate: Gate,
    chain: Arc<FakeChain>,
    bundler: Arc<FakeBundler>,
}

impl FakeWallet {
    fn new(
        address: Address,
        kind: AccountKind,
        erc6492: bool,
        chain: Arc<FakeChain>,
        bundler: Arc<FakeBundler>,
    ) -> Self {
        let factory = Address::repeat_byte(address.0[0] ^ 0xff);
        chain.add_factory(factory, address);
        Self {
            address,
            chain_id: CHAIN_ID,
            kind,
            factory,
            erc6492,
            reject_next: AtomicBool::new(false),
            revert_next: AtomicBool::new(false),
            next_hash: AtomicU8::new(1),
            chain_id_gate: Gate::default(),
            sign_gate: Gate::default(),
            chain,
            bundler,
        }
    }

    pub fn smart(chain: Arc<FakeChain>, bundler: Arc<FakeBundler>) -> Self {
        Self::new(
            Address::repeat_byte(0xaa),
            AccountKind::SmartAccount,
            false,
            chain,
            bundler,
        )
    }

    pub fn eoa(chain: Arc<FakeChain>, bundler: Arc<FakeBundler>) -> Self {
        Self::new(Address::repeat_byte(0xbb), AccountKind::Eoa, false, chain, bundler)
    }

    /// A counterfactual wallet signing with ERC-6492 wrapped signatures.
    pub fn eoa_erc6492(chain: Arc<FakeChain>, bundler: Arc<FakeBundler>) -> Self {
        Self::new(Address::repeat_byte(0xcc), AccountKind::Eoa, true, chain, bundler)
    }

    #[must_use]
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self.factory = Address::repeat_byte(address.0[0] ^ 0xff);
        self.chain.add_factory(self.factory, address);
        self
    }

    #[must_use]
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub const fn factory(&self) -> Address {
        self.factory
    }

    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// The next user operation is included but reverts.
    pub fn revert_next_user_operation(&self) {
        self.revert_next.store(true, Ordering::SeqCst);
    }

    fn check_rejection(&self) -> Result<(), DrawbridgeError> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(DrawbridgeError::UserRejected);
        }
        Ok(())
    }

    fn factory_data(&self) -> Bytes {
        Bytes::from(self.address.to_vec())
    }
}

#[async_trait]
impl WalletClient for FakeWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn chain_id(&self) -> Result<u64, DrawbridgeError> {
        self.chain_id_gate.pass().await;
        Ok(self.chain_id)
    }

    async fn account_kind(&self) -> Result<AccountKind, DrawbridgeError> {
        Ok(self.kind)
    }

    async fn smart_account(&self) -> Result<Option<AccountDescriptor>, DrawbridgeError> {
        if self.kind != AccountKind::SmartAccount {
            return Ok(None);
        }
        if self.chain.is_deployed(self.address) {
            return Ok(Some(AccountDescriptor::deployed(self.address)));
        }
        Ok(Some(AccountDescriptor {
            address: self.address,
            factory: Some(self.factory),
            factory_data: Some(self.factory_data()),
        }))
    }

    async fn sign_typed_data(&self, call: &TypedCall) -> Result<Bytes, DrawbridgeError> {
        self.sign_gate.pass().await;
        self.check_rejection()?;
        assert_eq!(call.message.signer, self.address);
        let signature = Bytes::from(vec![0x1b; 65]);
        if self.erc6492 && !self.chain.is_deployed(self.address) {
            return Ok(Erc6492Signature {
                factory: self.factory,
                factory_data: self.factory_data(),
                signature,
            }
            .wrap());
        }
        Ok(signature)
    }

    async fn send_transaction(&self, to: Address, data: Bytes) -> Result<B256, DrawbridgeError> {
        self.check_rejection()?;
        if to == self.factory {
            self.chain.deploy(self.address);
        }
        Ok(keccak256(data))
    }

    async fn send_user_operation(
        &self,
        account: &AccountDescriptor,
        calls: &[Execution],
    ) -> Result<B256, DrawbridgeError> {
        self.check_rejection()?;
        if account.has_factory_data() {
            self.chain.deploy(account.address);
        }
        let hash = B256::with_last_byte(self.next_hash.fetch_add(1, Ordering::SeqCst));
        if self.revert_next.swap(false, Ordering::SeqCst) {
            self.bundler.insert_receipt(hash, false);
            return Ok(hash);
        }
        for call in calls {
            self.chain.apply_registry_call(self.address, &call.data);
        }
        self.bundler.insert_receipt(hash, true);
        Ok(hash)
    }
}

/// Connector handing out a single configurable wallet.
pub struct FakeConnector {
    available: Mutex<Option<Arc<FakeWallet>>>,
    connected: Mutex<Option<Arc<FakeWallet>>>,
    restorable: bool,
    fail_connect: AtomicBool,
    accounts: watch::Sender<Option<Address>>,
    /// Holds the next disconnect before the wallet is released.
    pub disconnect_gate: Gate,
}

impl FakeConnector {
    pub fn new(wallet: Arc<FakeWallet>) -> Arc<Self> {
        Arc::new(Self::build(wallet, false))
    }

    /// A connector with a previous connection `reconnect` restores.
    pub fn restorable(wallet: Arc<FakeWallet>) -> Arc<Self> {
        Arc::new(Self::build(wallet, true))
    }

    fn build(wallet: Arc<FakeWallet>, restorable: bool) -> Self {
        let (accounts, _) = watch::channel(None);
        Self {
            available: Mutex::new(Some(wallet)),
            connected: Mutex::new(None),
            restorable,
            fail_connect: AtomicBool::new(false),
            accounts,
            disconnect_gate: Gate::default(),
        }
    }

    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    /// The user switches the connected wallet to another account.
    pub fn switch_to(&self, wallet: Arc<FakeWallet>) {
        let address = wallet.address();
        *self.available.lock().unwrap() = Some(wallet.clone());
        *self.connected.lock().unwrap() = Some(wallet);
        self.accounts.send_replace(Some(address));
    }

    fn connect_available(&self) {
        let wallet = self.available.lock().unwrap().clone();
        let address = wallet.as_ref().map(|wallet| wallet.address());
        *self.connected.lock().unwrap() = wallet;
        self.accounts.send_replace(address);
    }
}

#[async_trait]
impl WalletConnector for FakeConnector {
    async fn reconnect(&self) -> Result<bool, DrawbridgeError> {
        if !self.restorable {
            return Ok(false);
        }
        self.connect_available();
        Ok(true)
    }

    async fn connect(&self, _connector_id: &str) -> Result<(), DrawbridgeError> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(DrawbridgeError::Wallet("connector unavailable".to_string()));
        }
        if self.connected.lock().unwrap().is_some() {
            return Err(DrawbridgeError::AlreadyConnected);
        }
        self.connect_available();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DrawbridgeError> {
        self.disconnect_gate.pass().await;
        *self.connected.lock().unwrap() = None;
        self.accounts.send_replace(None);
        Ok(())
    }

    async fn wallet(&self) -> Result<Option<Arc<dyn WalletClient>>, DrawbridgeError> {
        Ok(self
            .connected
            .lock()
            .unwrap()
            .clone()
            .map(|wallet| wallet as Arc<dyn WalletClient>))
    }

    fn watch(&self) -> watch::Receiver<Option<Address>> {
        self.accounts.subscribe()
    }
}

/// Everything a test needs around one [`Drawbridge`] instance.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub bundler: Arc<FakeBundler>,
    pub wallet: Arc<FakeWallet>,
    pub connector: Arc<FakeConnector>,
    pub storage: Arc<dyn KeyValueStore>,
    pub drawbridge: Arc<Drawbridge>,
    pub statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
}

impl Harness {
    pub fn smart_wallet() -> Self {
        let chain = FakeChain::new();
        let bundler = FakeBundler::new(chain.clone());
        let wallet = Arc::new(FakeWallet::smart(chain.clone(), bundler.clone()));
        Self::with_wallet(config(), chain, bundler, wallet, Arc::new(MemoryStore::new()))
    }

    pub fn eoa() -> Self {
        let chain = FakeChain::new();
        let bundler = FakeBundler::new(chain.clone());
        let wallet = Arc::new(FakeWallet::eoa(chain.clone(), bundler.clone()));
        Self::with_wallet(config(), chain, bundler, wallet, Arc::new(MemoryStore::new()))
    }

    pub fn eoa_erc6492() -> Self {
        let chain = FakeChain::new();
        let bundler = FakeBundler::new(chain.clone());
        let wallet = Arc::new(FakeWallet::eoa_erc6492(chain.clone(), bundler.clone()));
        Self::with_wallet(config(), chain, bundler, wallet, Arc::new(MemoryStore::new()))
    }

    pub fn with_wallet(
        config: DrawbridgeConfig,
        chain: Arc<FakeChain>,
        bundler: Arc<FakeBundler>,
        wallet: Arc<FakeWallet>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::with_connector(
            config,
            chain,
            bundler,
            wallet.clone(),
            FakeConnector::new(wallet),
            storage,
        )
    }

    pub fn with_connector(
        config: DrawbridgeConfig,
        chain: Arc<FakeChain>,
        bundler: Arc<FakeBundler>,
        wallet: Arc<FakeWallet>,
        connector: Arc<FakeConnector>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let drawbridge = Drawbridge::builder(config)
            .connector(connector.clone())
            .chain(chain.clone())
            .bundler(bundler.clone())
            .storage(storage.clone())
            .build()
            .unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let recorded = statuses.clone();
        drawbridge.subscribe(Arc::new(move |state: &ConnectionState| {
            recorded.lock().unwrap().push(state.status);
        }));

        Self {
            chain,
            bundler,
            wallet,
            connector,
            storage,
            drawbridge,
            statuses,
        }
    }

    /// A second instance sharing chain, bundler, wallet and key storage, as after
    /// an application restart.
    pub fn restart(&self) -> Self {
        Self::with_wallet(
            self.drawbridge.config().clone(),
            self.chain.clone(),
            self.bundler.clone(),
            self.wallet.clone(),
            self.storage.clone(),
        )
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    /// Polls until `done` holds for the current state.
    pub async fn wait_until(&self, done: impl Fn(&ConnectionState) -> bool) {
        for _ in 0..200 {
            if done(&self.drawbridge.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never matched: {:?}", self.drawbridge.state());
    }
}

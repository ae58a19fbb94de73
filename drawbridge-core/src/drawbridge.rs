//! The session orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::account::SessionAccountProvisioner;
use crate::bundler::{Bundler, BundlerClient, Erc7677Paymaster, GasSponsor};
use crate::chain::{ChainClient, RpcChainClient};
use crate::config::DrawbridgeConfig;
use crate::delegation::{DelegationParams, DelegationStrategy};
use crate::error::DrawbridgeError;
use crate::logger;
use crate::registry::Registry;
use crate::session_client::{SessionClient, SessionClientBuilder};
use crate::signer::SessionSignerProvider;
use crate::state::{
    ConnectionState, ConnectionStatus, Listener, StateStore, StateUpdate, SubscriptionId,
};
use crate::storage::{KeyStore, KeyValueStore, MemoryStore};
use crate::wallet::{WalletClient, WalletConnector};

/// Holds a busy flag for the lifetime of the guard.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Builder for [`Drawbridge`].
pub struct DrawbridgeBuilder {
    config: DrawbridgeConfig,
    connector: Option<Arc<dyn WalletConnector>>,
    chain: Option<Arc<dyn ChainClient>>,
    bundler: Option<Arc<dyn Bundler>>,
    sponsor: Option<Arc<dyn GasSponsor>>,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl DrawbridgeBuilder {
    /// Wallet connector providing the user's wallet. Required.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn WalletConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Chain client. Defaults to an HTTP client for `rpc_url`.
    #[must_use]
    pub fn chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Bundler. Defaults to a JSON-RPC client for `bundler_url`, cost capped on
    /// fee-capped chains.
    #[must_use]
    pub fn bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    /// Gas sponsor. Defaults to an ERC-7677 client when `paymaster_url` is set.
    #[must_use]
    pub fn sponsor(mut self, sponsor: Arc<dyn GasSponsor>) -> Self {
        self.sponsor = Some(sponsor);
        self
    }

    /// Session key storage. Defaults to memory, so keys do not survive restarts.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates the configuration and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::InvalidConfig`] for an invalid configuration or
    /// a missing connector.
    pub fn build(self) -> Result<Arc<Drawbridge>, DrawbridgeError> {
        let config = self.config;
        config.validate()?;
        logger::set_enabled(config.logging);

        let registry = config.registry()?.map(Registry::new);
        let connector = self.connector.ok_or_else(|| DrawbridgeError::InvalidConfig {
            attribute: "connector".to_string(),
            reason: "a wallet connector is required".to_string(),
        })?;
        let chain: Arc<dyn ChainClient> = match self.chain {
            Some(chain) => chain,
            None => Arc::new(
                RpcChainClient::new(&config.rpc_url)?
                    .with_poll_interval(config.timings.receipt_poll_interval()),
            ),
        };
        let bundler: Arc<dyn Bundler> = self.bundler.unwrap_or_else(|| {
            Arc::new(
                BundlerClient::new(config.bundler_url.clone(), config.retry)
                    .with_cost_cap(config.cost_cap()),
            )
        });
        let sponsor = self.sponsor.or_else(|| {
            config.paymaster_url.as_ref().map(|url| {
                Arc::new(Erc7677Paymaster::new(url.clone(), config.retry)) as Arc<dyn GasSponsor>
            })
        });
        let storage: Arc<dyn KeyValueStore> = self.storage.unwrap_or_else(|| {
            log::warn!("no session key storage configured, keys will not be persisted");
            Arc::new(MemoryStore::new())
        });

        let key_store = Arc::new(KeyStore::new(storage));
        let provisioner = SessionAccountProvisioner::new(
            Arc::new(SessionSignerProvider::new(key_store.clone())),
            config.account_factory.clone(),
            config.entry_point,
            config.chain_id,
        );

        Ok(Arc::new(Drawbridge {
            config,
            registry,
            connector,
            chain,
            bundler,
            sponsor,
            key_store,
            provisioner,
            state: StateStore::new(),
            initialized: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            is_disconnecting: AtomicBool::new(false),
            is_setting_up: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }))
    }
}

/// Drives wallet connections and the session delegated by each user.
///
/// All state changes go through a single [`StateStore`]. Overlapping connector
/// events are dropped: a connection attempt while another one, or a disconnect,
/// is in flight does nothing.
pub struct Drawbridge {
    config: DrawbridgeConfig,
    registry: Option<Registry>,
    connector: Arc<dyn WalletConnector>,
    chain: Arc<dyn ChainClient>,
    bundler: Arc<dyn Bundler>,
    sponsor: Option<Arc<dyn GasSponsor>>,
    key_store: Arc<KeyStore>,
    provisioner: SessionAccountProvisioner,
    state: StateStore,
    initialized: AtomicBool,
    is_connecting: AtomicBool,
    is_disconnecting: AtomicBool,
    is_setting_up: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Drawbridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drawbridge")
            .field("chain_id", &self.config.chain_id)
            .field("registry", &self.registry)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drawbridge {
    /// Starts building an instance from `config`.
    #[must_use]
    pub const fn builder(config: DrawbridgeConfig) -> DrawbridgeBuilder {
        DrawbridgeBuilder {
            config,
            connector: None,
            chain: None,
            bundler: None,
            sponsor: None,
            storage: None,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &DrawbridgeConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.snapshot()
    }

    /// Session client of the connected user.
    #[must_use]
    pub fn session_client(&self) -> Option<Arc<SessionClient>> {
        self.state.snapshot().session_client
    }

    /// Calls `listener` after every state change.
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        self.state.subscribe(listener)
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    /// Restores a previous connection, then starts following the connector.
    ///
    /// The restored session is built before this returns. Calling it again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of re-establishing the restored session. Failing to
    /// restore a connection is only logged.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), DrawbridgeError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // subscribed before the replay so later account changes are not missed
        let accounts = self.connector.watch();
        self.state
            .update(StateUpdate::status(ConnectionStatus::Disconnected));

        let result = match self.connector.reconnect().await {
            Ok(true) => self.handle_wallet_connection().await,
            Ok(false) => Ok(()),
            Err(err) => {
                log::warn!("failed to restore the previous wallet connection: {err}");
                Ok(())
            }
        };

        let handle = self.spawn_watcher(accounts);
        match self.watcher.lock() {
            Ok(mut watcher) => *watcher = Some(handle),
            Err(_) => {
                handle.abort();
                return Err(DrawbridgeError::Generic(
                    "watcher lock poisoned".to_string(),
                ));
            }
        }
        result
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        mut accounts: watch::Receiver<Option<Address>>,
    ) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while accounts.changed().await.is_ok() {
                let Some(this) = this.upgrade() else {
                    break;
                };
                if let Err(err) = this.handle_wallet_connection().await {
                    log::warn!("wallet connection change failed: {err}");
                }
            }
        })
    }

    /// Connects the connector with id `connector_id` and builds the session.
    ///
    /// # Errors
    ///
    /// Connector failures other than an existing connection return the state to
    /// disconnected. Session errors leave the state in
    /// [`ConnectionStatus::Error`]. Both are returned.
    pub async fn connect_wallet(
        &self,
        connector_id: &str,
    ) -> Result<ConnectionState, DrawbridgeError> {
        let Some(_connecting) = FlagGuard::acquire(&self.is_connecting) else {
            log::debug!("connection already in progress, ignoring connect to {connector_id}");
            return Ok(self.state.snapshot());
        };
        let previous = self.state.snapshot();
        self.state
            .update(StateUpdate::status(ConnectionStatus::Connecting).with_error(None));

        match self.connector.connect(connector_id).await {
            Ok(()) | Err(DrawbridgeError::AlreadyConnected) => {}
            Err(err) => {
                self.state.update(
                    StateUpdate::status(ConnectionStatus::Disconnected)
                        .with_error(Some(err.message())),
                );
                return Err(err);
            }
        }

        self.establish_session(true, &previous).await?;
        Ok(self.state.snapshot())
    }

    /// Reacts to the connector's current wallet: builds the session of a newly
    /// connected user, or returns to disconnected when no wallet is connected.
    ///
    /// Ignored while a disconnect or another connection is in flight.
    ///
    /// # Errors
    ///
    /// Returns the error that moved the state to [`ConnectionStatus::Error`].
    pub async fn handle_wallet_connection(&self) -> Result<(), DrawbridgeError> {
        if self.is_disconnecting.load(Ordering::Acquire) {
            log::debug!("disconnect in progress, ignoring wallet connection event");
            return Ok(());
        }
        let Some(_connecting) = FlagGuard::acquire(&self.is_connecting) else {
            log::debug!("connection already in progress, ignoring wallet connection event");
            return Ok(());
        };
        let previous = self.state.snapshot();
        self.establish_session(false, &previous).await
    }

    /// Builds the session of the connector's wallet. `previous` is the state
    /// before this attempt, restored when the user already has a session.
    async fn establish_session(
        &self,
        require_wallet: bool,
        previous: &ConnectionState,
    ) -> Result<(), DrawbridgeError> {
        let wallet = match self.connector.wallet().await {
            Ok(Some(wallet)) => wallet,
            Ok(None) if !require_wallet => {
                self.state.update(
                    StateUpdate::status(ConnectionStatus::Disconnected)
                        .clear_session()
                        .with_error(None),
                );
                return Ok(());
            }
            Ok(None) => return Err(self.fail(DrawbridgeError::NoConnector)),
            Err(err) => return Err(self.fail(err)),
        };

        let user = wallet.address();
        if previous.user_address == Some(user)
            && previous.session_client.is_some()
            && matches!(
                previous.status,
                ConnectionStatus::Connected
                    | ConnectionStatus::SettingUpSession
                    | ConnectionStatus::Ready
            )
        {
            if self.state.snapshot().status != previous.status {
                self.state.update(StateUpdate::status(previous.status));
            }
            return Ok(());
        }

        match self.build_session(wallet.as_ref()).await {
            Ok(_) if !self.still_connected(user).await => {
                log::debug!("{user} disconnected while its session was built, dropping it");
                Ok(())
            }
            Ok((client, delegated)) => {
                let status = if delegated {
                    ConnectionStatus::Ready
                } else {
                    ConnectionStatus::Connected
                };
                log::info!(
                    "connected {user} with session {} ({status})",
                    client.session_address()
                );
                self.state.update(
                    StateUpdate::status(status)
                        .with_session(client)
                        .with_error(None),
                );
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn build_session(
        &self,
        wallet: &dyn WalletClient,
    ) -> Result<(Arc<SessionClient>, bool), DrawbridgeError> {
        let chain_id = wallet.chain_id().await?;
        if chain_id != self.config.chain_id {
            return Err(DrawbridgeError::ChainMismatch {
                expected: self.config.chain_id,
                actual: chain_id,
            });
        }

        let user = wallet.address();
        let session = self.provisioner.provision(self.chain.clone(), user);
        let client = Arc::new(
            SessionClientBuilder::new(session.account, user, self.bundler.clone())
                .registry(self.registry)
                .sponsor(self.sponsor.clone())
                .fee_policy(self.config.fee_policy())
                .timings(self.config.timings)
                .build(),
        );
        let delegated = client.has_delegation().await?;
        Ok((client, delegated))
    }

    /// Whether `user` is still the connector's wallet and no disconnect is in flight.
    async fn still_connected(&self, user: Address) -> bool {
        if self.is_disconnecting.load(Ordering::Acquire) {
            return false;
        }
        matches!(
            self.connector.wallet().await,
            Ok(Some(wallet)) if wallet.address() == user
        )
    }

    fn fail(&self, err: DrawbridgeError) -> DrawbridgeError {
        log::warn!("wallet connection failed: {err}");
        self.state.update(
            StateUpdate::status(ConnectionStatus::Error)
                .clear_session()
                .with_error(Some(err.message())),
        );
        err
    }

    /// Registers the delegation of the connected user to their session account.
    ///
    /// Returns immediately when the session is ready or a setup is already
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`DrawbridgeError::NotConnected`] without a session. Registration
    /// errors, including wallet rejections, return the state to
    /// [`ConnectionStatus::Connected`] so the call can be retried.
    pub async fn setup_session(&self) -> Result<(), DrawbridgeError> {
        let current = self.state.snapshot();
        let client = current
            .session_client
            .ok_or(DrawbridgeError::NotConnected)?;
        if matches!(
            current.status,
            ConnectionStatus::Ready | ConnectionStatus::SettingUpSession
        ) {
            return Ok(());
        }
        let Some(_setting_up) = FlagGuard::acquire(&self.is_setting_up) else {
            log::debug!("session setup already in progress");
            return Ok(());
        };
        let registry = self.registry.ok_or_else(|| DrawbridgeError::InvalidConfig {
            attribute: "registry_address".to_string(),
            reason: "session setup requires a registry".to_string(),
        })?;
        let wallet = self
            .connector
            .wallet()
            .await?
            .filter(|wallet| wallet.address() == client.user_address())
            .ok_or(DrawbridgeError::NotConnected)?;

        self.state
            .update(StateUpdate::status(ConnectionStatus::SettingUpSession).with_error(None));

        let result = async {
            let strategy = DelegationStrategy::for_account_kind(wallet.account_kind().await?);
            let params = DelegationParams {
                wallet: wallet.as_ref(),
                session: client.as_ref(),
                registry,
            };
            strategy.register_delegation(&params).await
        }
        .await;

        match result {
            Ok(()) => {
                log::info!("session {} is ready", client.session_address());
                self.state
                    .update(StateUpdate::status(ConnectionStatus::Ready).with_error(None));
                Ok(())
            }
            Err(err) => {
                log::warn!("session setup failed: {err}");
                self.state.update(
                    StateUpdate::status(ConnectionStatus::Connected)
                        .with_error(Some(err.message())),
                );
                Err(err)
            }
        }
    }

    /// Disconnects the wallet and drops the session.
    ///
    /// # Errors
    ///
    /// Returns the connector's error; the state is disconnected either way.
    pub async fn disconnect(&self) -> Result<(), DrawbridgeError> {
        let Some(_disconnecting) = FlagGuard::acquire(&self.is_disconnecting) else {
            return Ok(());
        };
        let result = self.connector.disconnect().await;
        self.state.update(
            StateUpdate::status(ConnectionStatus::Disconnected)
                .clear_session()
                .with_error(None),
        );
        result
    }

    /// Stops following the connector and drops the session.
    pub fn destroy(&self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
        self.state.update(
            StateUpdate::status(ConnectionStatus::Disconnected)
                .clear_session()
                .with_error(None),
        );
    }

    /// Deletes every stored session key.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn clear_storage(&self) -> Result<(), DrawbridgeError> {
        self.key_store.clear()?;
        Ok(())
    }
}

impl Drop for Drawbridge {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
    }
}

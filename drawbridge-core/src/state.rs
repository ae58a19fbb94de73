//! Observable connection state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use serde::Serialize;

use crate::session_client::SessionClient;

/// Lifecycle of a wallet connection and its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    /// `initialize` has not run yet.
    #[default]
    Uninitialized,
    /// No wallet connected.
    Disconnected,
    /// A wallet connection is being established.
    Connecting,
    /// Wallet connected, the session has no delegation yet.
    Connected,
    /// The delegation is being registered.
    SettingUpSession,
    /// The session can act for the user.
    Ready,
    /// The last connection attempt failed.
    Error,
}

/// Snapshot handed to subscribers.
///
/// A session client is only present together with the user and session
/// addresses, and `is_ready` is only set in [`ConnectionStatus::Ready`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// Session client of the connected user.
    pub session_client: Option<Arc<SessionClient>>,
    /// Connected user.
    pub user_address: Option<Address>,
    /// Session account of the connected user.
    pub session_address: Option<Address>,
    /// Whether the session is usable.
    pub is_ready: bool,
    /// Message of the last error.
    pub error: Option<String>,
}

/// Partial update merged into the state. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option, missing_docs)]
pub struct StateUpdate {
    pub status: Option<ConnectionStatus>,
    pub session_client: Option<Option<Arc<SessionClient>>>,
    pub user_address: Option<Option<Address>>,
    pub session_address: Option<Option<Address>>,
    pub error: Option<Option<String>>,
}

impl StateUpdate {
    /// Update changing only the status.
    #[must_use]
    pub fn status(status: ConnectionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    /// Clears the session client and both addresses.
    #[must_use]
    pub fn clear_session(mut self) -> Self {
        self.session_client = Some(None);
        self.user_address = Some(None);
        self.session_address = Some(None);
        self
    }

    /// Installs `client` with the addresses it is bound to.
    #[must_use]
    pub fn with_session(mut self, client: Arc<SessionClient>) -> Self {
        self.user_address = Some(Some(client.user_address()));
        self.session_address = Some(Some(client.session_address()));
        self.session_client = Some(Some(client));
        self
    }
}

impl ConnectionState {
    fn merge(&mut self, update: StateUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(client) = update.session_client {
            self.session_client = client;
        }
        if let Some(user) = update.user_address {
            self.user_address = user;
        }
        if let Some(session) = update.session_address {
            self.session_address = session;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(client) = &self.session_client {
            self.user_address = Some(client.user_address());
            self.session_address = Some(client.session_address());
        }
        self.is_ready = self.status == ConnectionStatus::Ready;
    }
}

/// Subscriber callback.
pub type Listener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// Handle returned by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Owner of the [`ConnectionState`]; the only place it changes.
pub struct StateStore {
    state: Mutex<ConnectionState>,
    listeners: Mutex<BTreeMap<SubscriptionId, Listener>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Store in [`ConnectionStatus::Uninitialized`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::default()),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Merges `update` and notifies every subscriber once with the result.
    pub fn update(&self, update: StateUpdate) -> ConnectionState {
        let snapshot = {
            let Ok(mut state) = self.state.lock() else {
                log::error!("connection state lock poisoned, dropping update");
                return ConnectionState::default();
            };
            state.merge(update);
            state.clone()
        };
        log::debug!("connection status is now {}", snapshot.status);

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(&snapshot);
        }
        snapshot
    }

    /// Calls `listener` after every update.
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, listener);
        }
        id
    }

    /// Removes a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners
            .lock()
            .map(|mut listeners| listeners.remove(&id).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_update_merges_and_derives_readiness() {
        let store = StateStore::new();
        assert_eq!(store.snapshot().status, ConnectionStatus::Uninitialized);

        let state = store.update(StateUpdate::status(ConnectionStatus::Ready));
        assert!(state.is_ready);

        let state = store.update(
            StateUpdate::status(ConnectionStatus::Connected).with_error(Some("boom".to_string())),
        );
        assert!(!state.is_ready);
        assert_eq!(state.error.as_deref(), Some("boom"));

        // fields left out of an update are kept
        let state = store.update(StateUpdate::default());
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.error.as_deref(), Some("boom"));

        let state = store.update(StateUpdate::default().with_error(None));
        assert!(state.error.is_none());
    }

    #[test]
    fn test_clear_session_removes_addresses() {
        let store = StateStore::new();
        store.update(StateUpdate {
            user_address: Some(Some(Address::repeat_byte(0x01))),
            session_address: Some(Some(Address::repeat_byte(0x02))),
            ..StateUpdate::default()
        });
        let state = store.update(StateUpdate::status(ConnectionStatus::Disconnected).clear_session());
        assert!(state.user_address.is_none());
        assert!(state.session_address.is_none());
        assert!(state.session_client.is_none());
    }

    #[test]
    fn test_listeners_are_notified_once_per_update() {
        let store = StateStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = store.subscribe(Arc::new(move |_state: &ConnectionState| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.update(StateUpdate::status(ConnectionStatus::Connecting));
        store.update(StateUpdate::status(ConnectionStatus::Connected));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.update(StateUpdate::status(ConnectionStatus::Disconnected));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(ConnectionStatus::SettingUpSession.to_string(), "setting_up_session");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Ready).unwrap(),
            "\"ready\""
        );
    }
}

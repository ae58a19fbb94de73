//! `drawbridge-core` lets an application act for a connected wallet through a
//! local session key.
//!
//! Each user gets a session signer owning a counterfactual ERC-4337 smart
//! account. Once the user registers a delegation to that account in the
//! registry, the application relays calls through a bundler without prompting
//! the wallet again. [`Drawbridge`] drives the whole lifecycle and publishes a
//! [`ConnectionState`] to subscribers.
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod account;
pub mod bundler;
pub mod chain;
pub mod config;
pub mod defaults;
pub mod delegation;
pub mod deployment;
pub mod fees;
pub mod logger;
pub mod registry;
pub mod session_client;
pub mod signer;
pub mod state;
pub mod storage;
pub mod transport;
pub mod user_operation;
pub mod wallet;

mod drawbridge;
pub use drawbridge::{Drawbridge, DrawbridgeBuilder};

mod error;
pub use error::*;

pub use config::DrawbridgeConfig;
pub use session_client::SessionClient;
pub use state::{ConnectionState, ConnectionStatus, StateUpdate, SubscriptionId};
pub use wallet::{AccountKind, WalletClient, WalletConnector};

/// Result type of fallible Drawbridge operations.
pub type DrawbridgeResult<T, E = DrawbridgeError> = std::result::Result<T, E>;

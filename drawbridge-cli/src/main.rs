//! `drawbridge`: inspect and manage Drawbridge session keys from the terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use drawbridge_core::account::SessionAccountProvisioner;
use drawbridge_core::chain::RpcChainClient;
use drawbridge_core::fees::FeeRegime;
use drawbridge_core::registry::Registry;
use drawbridge_core::signer::SessionSignerProvider;
use drawbridge_core::storage::{FileStore, KeyStore};
use drawbridge_core::DrawbridgeConfig;
use eyre::{eyre, OptionExt, WrapErr};
use serde_json::json;

const KEY_FILE: &str = "session-keys.json";

#[derive(Parser)]
#[command(name = "drawbridge")]
#[command(about = "Inspect Drawbridge session keys, fees and delegations")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, env = "DRAWBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the session key store
    #[arg(long, env = "DRAWBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the session signer and session account of a user
    SessionKey {
        /// The user's wallet address
        user: Address,
    },
    /// Remove the stored session key of a user
    Forget {
        /// The user's wallet address
        user: Address,
    },
    /// Remove every stored session key
    Clear,
    /// Print the fees the next session operation would use
    Fees,
    /// Report whether a user delegated to their session account
    Delegation {
        /// The user's wallet address
        user: Address,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let key_store = open_key_store(cli.data_dir.as_deref())?;
    match cli.command {
        Command::SessionKey { user } => {
            let config = load_config(cli.config.as_deref())?;
            session_key(&config, key_store, user).await
        }
        Command::Forget { user } => {
            key_store.remove_signer(user)?;
            tracing::info!("removed session key of {user}");
            Ok(())
        }
        Command::Clear => {
            key_store.clear()?;
            tracing::info!("removed all session keys");
            Ok(())
        }
        Command::Fees => fees(&load_config(cli.config.as_deref())?).await,
        Command::Delegation { user } => {
            let config = load_config(cli.config.as_deref())?;
            delegation(&config, key_store, user).await
        }
    }
}

fn init_tracing(verbose: bool) -> eyre::Result<()> {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| eyre!("failed to install the log subscriber: {err}"))
}

fn load_config(path: Option<&Path>) -> eyre::Result<DrawbridgeConfig> {
    let path = path.ok_or_eyre("this command needs --config or DRAWBRIDGE_CONFIG")?;
    let json = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let config = DrawbridgeConfig::from_json(&json)?;
    drawbridge_core::logger::set_enabled(config.logging);
    Ok(config)
}

fn key_file(data_dir: Option<&Path>) -> eyre::Result<PathBuf> {
    let dir = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .ok_or_eyre("no data directory on this platform, pass --data-dir")?
            .join("drawbridge"),
    };
    Ok(dir.join(KEY_FILE))
}

fn open_key_store(data_dir: Option<&Path>) -> eyre::Result<Arc<KeyStore>> {
    let path = key_file(data_dir)?;
    tracing::debug!("session keys at {}", path.display());
    let backend = FileStore::open(path)?;
    Ok(Arc::new(KeyStore::new(Arc::new(backend))))
}

fn provisioner(config: &DrawbridgeConfig, key_store: Arc<KeyStore>) -> SessionAccountProvisioner {
    SessionAccountProvisioner::new(
        Arc::new(SessionSignerProvider::new(key_store)),
        config.account_factory.clone(),
        config.entry_point,
        config.chain_id,
    )
}

async fn session_key(
    config: &DrawbridgeConfig,
    key_store: Arc<KeyStore>,
    user: Address,
) -> eyre::Result<()> {
    let chain = Arc::new(RpcChainClient::new(&config.rpc_url)?);
    let session = provisioner(config, key_store).provision(chain, user);
    let deployed = session.account.is_deployed().await?;
    print_json(&json!({
        "user": user,
        "signer": session.signer.address(),
        "session_account": session.account.address(),
        "deployed": deployed,
    }))
}

async fn fees(config: &DrawbridgeConfig) -> eyre::Result<()> {
    let chain = RpcChainClient::new(&config.rpc_url)?;
    let policy = config.fee_policy();
    let estimate = policy.estimate(&chain).await;
    let regime = match policy.regime() {
        FeeRegime::Free => "free",
        FeeRegime::Capped(_) => "capped",
        FeeRegime::Passthrough => "passthrough",
    };
    print_json(&json!({
        "chain_id": policy.chain_id(),
        "regime": regime,
        "max_fee_per_gas": estimate.max_fee_per_gas.to_string(),
        "max_priority_fee_per_gas": estimate.max_priority_fee_per_gas.to_string(),
        "operation_budget_wei": config.cost_cap().map(|cap| cap.budget_wei().to_string()),
    }))
}

async fn delegation(
    config: &DrawbridgeConfig,
    key_store: Arc<KeyStore>,
    user: Address,
) -> eyre::Result<()> {
    let registry = config
        .registry()?
        .map(Registry::new)
        .ok_or_eyre("the configuration has no registry_address")?;
    let chain = Arc::new(RpcChainClient::new(&config.rpc_url)?);
    let session = provisioner(config, key_store).provision(chain.clone(), user);
    let delegated = registry
        .has_delegation(chain.as_ref(), user, session.account.address())
        .await?;
    print_json(&json!({
        "user": user,
        "session_account": session.account.address(),
        "registry": registry.address(),
        "delegated": delegated,
    }))
}

fn print_json(value: &serde_json::Value) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

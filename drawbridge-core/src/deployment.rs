//! Counterfactual account deployment.

use alloy::primitives::{Address, Bytes};
use alloy::sol_types::SolValue;

use crate::account::SessionAccount;
use crate::chain::ChainClient;
use crate::config::Timings;
use crate::defaults::ERC6492_MAGIC;
use crate::error::DrawbridgeError;
use crate::session_client::SessionClient;
use crate::user_operation::Execution;
use crate::wallet::{AccountDescriptor, WalletClient};

/// JSON-RPC error code bundlers use for entry point validation failures.
const VALIDATION_ERROR_CODE: i64 = -32500;

/// Entry point error raised when `initCode` targets a deployed sender.
const ALREADY_CONSTRUCTED_CODE: &str = "AA10";

const ALREADY_DEPLOYED_PHRASES: [&str; 2] = ["already constructed", "already deployed"];

/// Whether `err` reports that the account being deployed already exists.
///
/// Typed errors and JSON-RPC payloads are checked first. Otherwise only errors
/// carrying upstream text are matched, against the `AA10` code as a whole token
/// and a few known phrases. Timeouts and reverted transactions never match, as
/// their messages hold nothing but hex hashes.
#[must_use]
pub fn is_already_deployed(err: &DrawbridgeError) -> bool {
    let upstream = match err {
        DrawbridgeError::AccountAlreadyDeployed => return true,
        DrawbridgeError::Rpc { code, message } => {
            if *code == VALIDATION_ERROR_CODE && has_already_constructed_code(message) {
                return true;
            }
            message
        }
        DrawbridgeError::Wallet(message) | DrawbridgeError::Generic(message) => message,
        DrawbridgeError::UserOperationFailed { reason, .. } => reason,
        DrawbridgeError::NetworkError { error, .. } => error,
        _ => return false,
    };
    if has_already_constructed_code(upstream) {
        return true;
    }
    let upstream = upstream.to_lowercase();
    ALREADY_DEPLOYED_PHRASES
        .iter()
        .any(|phrase| upstream.contains(phrase))
}

fn has_already_constructed_code(message: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == ALREADY_CONSTRUCTED_CODE)
}

/// Maps deployment races during delegation registration to a retryable error.
#[must_use]
pub fn registration_error(err: DrawbridgeError) -> DrawbridgeError {
    if is_already_deployed(&err) {
        log::warn!("delegation registration raced an account deployment: {err}");
        DrawbridgeError::DeploymentConflict
    } else {
        err
    }
}

/// Parts of an ERC-6492 wrapped signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc6492Signature {
    /// Factory deploying the signer.
    pub factory: Address,
    /// Deployment calldata.
    pub factory_data: Bytes,
    /// Signature valid once the signer is deployed.
    pub signature: Bytes,
}

impl Erc6492Signature {
    /// The wrapped encoding: `abi.encode(factory, factoryData, signature) ‖ magic`.
    #[must_use]
    pub fn wrap(&self) -> Bytes {
        let mut out = (
            self.factory,
            self.factory_data.clone(),
            self.signature.clone(),
        )
            .abi_encode_params();
        out.extend_from_slice(ERC6492_MAGIC.as_slice());
        out.into()
    }
}

/// Unwraps an ERC-6492 signature. Returns `None` for plain signatures.
///
/// # Errors
///
/// Returns an error if the signature ends with the magic suffix but the wrapped
/// payload does not decode.
pub fn parse_erc6492(signature: &[u8]) -> Result<Option<Erc6492Signature>, DrawbridgeError> {
    let Some(payload) = signature.strip_suffix(ERC6492_MAGIC.as_slice()) else {
        return Ok(None);
    };
    let (factory, factory_data, inner) = <(Address, Bytes, Bytes)>::abi_decode_params(payload)?;
    Ok(Some(Erc6492Signature {
        factory,
        factory_data,
        signature: inner,
    }))
}

/// Deploys the user's smart wallet from its own factory data if it has no code
/// yet, and returns the descriptor without deployment data.
///
/// After a deployment the settle delay gives the bundler time to observe the
/// new code before the next user operation is estimated.
///
/// # Errors
///
/// Returns an error if the deployment transaction fails or reverts while the
/// wallet stays undeployed.
pub async fn deploy_wallet_if_needed(
    chain: &dyn ChainClient,
    wallet: &dyn WalletClient,
    account: &AccountDescriptor,
    timings: &Timings,
) -> Result<AccountDescriptor, DrawbridgeError> {
    let (Some(factory), Some(factory_data)) = (account.factory, account.factory_data.clone())
    else {
        return Ok(account.without_factory_data());
    };
    if !chain.get_code(account.address).await?.is_empty() {
        log::debug!("wallet {} is already deployed", account.address);
        return Ok(account.without_factory_data());
    }

    log::info!("deploying wallet {} through {factory}", account.address);
    match wallet.send_transaction(factory, factory_data).await {
        Ok(hash) => {
            let outcome = chain
                .wait_for_transaction_receipt(hash, timings.receipt_timeout())
                .await?;
            if !outcome.success && chain.get_code(account.address).await?.is_empty() {
                return Err(DrawbridgeError::TransactionReverted {
                    hash: hash.to_string(),
                });
            }
            tokio::time::sleep(timings.settle_delay()).await;
        }
        Err(err) if is_already_deployed(&err) => {
            log::debug!("wallet {} was deployed concurrently", account.address);
        }
        Err(err) => return Err(err),
    }

    Ok(account.without_factory_data())
}

/// Deploys the signer of an ERC-6492 signature through the session account.
/// Returns `true` if a deployment was sent.
///
/// # Errors
///
/// Returns an error if the deployment operation fails for any reason other than
/// the signer already existing.
pub async fn deploy_erc6492_signer(
    client: &SessionClient,
    signer: Address,
    wrapped: &Erc6492Signature,
) -> Result<bool, DrawbridgeError> {
    if !client.chain().get_code(signer).await?.is_empty() {
        return Ok(false);
    }
    log::info!("deploying signer {signer} from its ERC-6492 signature");
    let deploy = Execution::new(wrapped.factory, wrapped.factory_data.clone());
    match client.execute(&[deploy]).await {
        Ok(_) => Ok(true),
        Err(err) if is_already_deployed(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Deploys the session account unless it already has code.
///
/// The deployment is an operation with a single empty call, bounded by the
/// deployment timeout. When the deadline passes the deployment status is read
/// once more, since slow operations often land shortly after.
///
/// # Errors
///
/// Returns [`DrawbridgeError::DeploymentFailed`] if the account is still
/// undeployed afterwards.
pub async fn ensure_session_account_deployed(client: &SessionClient) -> Result<(), DrawbridgeError> {
    let account = client.account();
    if account.is_deployed().await? {
        return Ok(());
    }

    log::info!("deploying session account {}", account.address());
    let deadline = client.timings().deployment_timeout();
    match tokio::time::timeout(
        deadline,
        client.execute(&[SessionAccount::noop_call()]),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) if is_already_deployed(&err) => Ok(()),
        Ok(Err(err)) => Err(DrawbridgeError::DeploymentFailed(err.message())),
        Err(_) => {
            if account.is_deployed().await? {
                log::debug!("session account deployment landed after the deadline");
                Ok(())
            } else {
                Err(DrawbridgeError::DeploymentFailed(format!(
                    "session account {} not deployed after {deadline:?}",
                    account.address()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DrawbridgeError::AccountAlreadyDeployed, true ; "typed")]
    #[test_case(DrawbridgeError::Rpc { code: -32500, message: "AA10 sender already constructed".into() }, true ; "rpc payload")]
    #[test_case(DrawbridgeError::Wallet("execution reverted: account already deployed".into()), true ; "message fallback")]
    #[test_case(DrawbridgeError::UserOperationFailed { hash: "0x01".into(), reason: "AA10 sender already constructed".into() }, true ; "revert reason code")]
    #[test_case(DrawbridgeError::Rpc { code: -32000, message: "AA10".into() }, true ; "code outside validation errors")]
    #[test_case(DrawbridgeError::Wallet("signed 0x1234aa10ff".into()), false ; "code inside hex")]
    #[test_case(DrawbridgeError::Timeout("receipt for user operation 0x1234aa10ff".into()), false ; "timeout with hash")]
    #[test_case(DrawbridgeError::TransactionReverted { hash: "0x1234aa10ff".into() }, false ; "reverted with hash")]
    #[test_case(DrawbridgeError::Timeout("account already deployed".into()), false ; "timeout never matches")]
    #[test_case(DrawbridgeError::Rpc { code: -32500, message: "AA21 didn't pay prefund".into() }, false ; "other validation error")]
    #[test_case(DrawbridgeError::UserRejected, false ; "rejection")]
    fn test_is_already_deployed(err: DrawbridgeError, expected: bool) {
        assert_eq!(is_already_deployed(&err), expected);
    }

    #[test]
    fn test_registration_error_maps_conflicts() {
        assert!(matches!(
            registration_error(DrawbridgeError::AccountAlreadyDeployed),
            DrawbridgeError::DeploymentConflict
        ));
        assert!(matches!(
            registration_error(DrawbridgeError::UserRejected),
            DrawbridgeError::UserRejected
        ));
        assert!(matches!(
            registration_error(DrawbridgeError::Timeout(
                "receipt for user operation 0x1234aa10ff".into()
            )),
            DrawbridgeError::Timeout(_)
        ));
    }

    #[test]
    fn test_erc6492_round_trip() {
        let wrapped = Erc6492Signature {
            factory: Address::repeat_byte(0xfa),
            factory_data: Bytes::from(vec![0x01, 0x02, 0x03]),
            signature: Bytes::from(vec![0x1b; 65]),
        };
        let encoded = wrapped.wrap();
        assert_eq!(&encoded[encoded.len() - 32..], ERC6492_MAGIC.as_slice());
        assert_eq!(parse_erc6492(&encoded).unwrap(), Some(wrapped));
    }

    #[test]
    fn test_plain_signature_is_not_wrapped() {
        assert_eq!(parse_erc6492(&[0x1b; 65]).unwrap(), None);
    }

    #[test]
    fn test_truncated_wrapper_is_an_error() {
        let mut truncated = vec![0u8; 10];
        truncated.extend_from_slice(ERC6492_MAGIC.as_slice());
        assert!(parse_erc6492(&truncated).is_err());
    }
}

use crate::bundler::wait_for_user_operation_receipt;
use crate::deployment::{deploy_wallet_if_needed, ensure_session_account_deployed, registration_error};
use crate::error::DrawbridgeError;
use crate::registry::Registry;
use crate::session_client::ensure_success;
use crate::user_operation::Execution;

use super::DelegationParams;

pub(super) async fn register(params: &DelegationParams<'_>) -> Result<(), DrawbridgeError> {
    let session = params.session;
    let timings = session.timings();

    let account = params
        .wallet
        .smart_account()
        .await?
        .ok_or_else(|| DrawbridgeError::Wallet("connected wallet has no smart account".to_string()))?;
    let account =
        deploy_wallet_if_needed(session.chain().as_ref(), params.wallet, &account, &timings).await?;

    let register = Execution::new(
        params.registry.address(),
        Registry::register_delegation_calldata(session.session_address()),
    );
    let hash = params
        .wallet
        .send_user_operation(&account, &[register])
        .await
        .map_err(registration_error)?;
    log::debug!("delegation user operation {hash} sent from {}", account.address);

    let receipt = wait_for_user_operation_receipt(
        session.bundler().as_ref(),
        hash,
        timings.receipt_poll_interval(),
        timings.receipt_timeout(),
    )
    .await?;
    ensure_success(receipt).map_err(registration_error)?;

    ensure_session_account_deployed(session).await
}

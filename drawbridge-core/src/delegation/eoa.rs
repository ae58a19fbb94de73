use crate::deployment::{
    deploy_erc6492_signer, ensure_session_account_deployed, parse_erc6492, registration_error,
};
use crate::error::DrawbridgeError;
use crate::registry::{registration_system, Registry};
use crate::user_operation::Execution;

use super::DelegationParams;

pub(super) async fn register(params: &DelegationParams<'_>) -> Result<(), DrawbridgeError> {
    let session = params.session;
    let registry = params.registry;
    let user = params.wallet.address();
    let system = registration_system();

    let nonce = registry
        .call_with_signature_nonce(session.chain().as_ref(), user)
        .await?;
    let call_data = Registry::register_delegation_calldata(session.session_address());
    let typed = registry.typed_call(
        session.account().chain_id(),
        user,
        system,
        call_data.clone(),
        nonce,
    );
    let signature = params.wallet.sign_typed_data(&typed).await?;

    // counterfactual smart wallets sign with ERC-6492 and must exist before the
    // registry can verify the inner signature
    let signature = match parse_erc6492(&signature)? {
        Some(wrapped) => {
            deploy_erc6492_signer(session, user, &wrapped).await?;
            wrapped.signature
        }
        None => signature,
    };

    let relay = Execution::new(
        registry.address(),
        Registry::call_with_signature_calldata(user, system, call_data, signature),
    );
    session.execute(&[relay]).await.map_err(registration_error)?;

    ensure_session_account_deployed(session).await
}

use anyhow::{anyhow, Result};
use finchat_core::{CredentialStore, IdentityAuthority, Principal};
use tracing::{info, warn};

/// Signs in whenever email and password are configured, so the authority holds
/// a refresh token for the rest of the run.
///
/// Without them a fresh stored credential is used as is; once it goes stale the
/// authority cannot renew it and the transport signs out.
pub async fn ensure_signed_in(
    authority: &dyn IdentityAuthority,
    store: &CredentialStore,
    can_sign_in: bool,
) -> Result<Principal> {
    if !can_sign_in {
        if let Some(credential) = store.fresh() {
            warn!(
                expires_at = ?credential.expires_at(),
                "no sign-in configured; using the stored credential until it expires"
            );
            return Ok(credential.principal().clone());
        }
    }
    let principal = authority.sign_in().await.map_err(|err| {
        anyhow!("sign-in failed: {err}. Set FINCHAT_EMAIL and FINCHAT_PASSWORD or add them to finchat.yaml.")
    })?;
    info!(principal = %principal.id, "signed in");
    Ok(principal)
}

use crate::auth::{Credential, CredentialStore};
use crate::error::CredentialError;
use crate::identity::IdentityAuthority;
use crate::singleflight::SingleFlight;
use std::sync::Arc;
use tracing::{info, warn};

/// Hands out a usable bearer credential, refreshing it through the identity
/// authority at most once at a time.
#[derive(Clone)]
pub struct TokenProvider {
    authority: Arc<dyn IdentityAuthority>,
    store: Arc<CredentialStore>,
    refresh: Arc<SingleFlight<Credential, CredentialError>>,
    // A forced caller is only ever answered by a forced authority call.
    forced: Arc<SingleFlight<Credential, CredentialError>>,
}

impl TokenProvider {
    pub fn new(authority: Arc<dyn IdentityAuthority>, store: Arc<CredentialStore>) -> Self {
        Self {
            authority,
            store,
            refresh: Arc::new(SingleFlight::new()),
            forced: Arc::new(SingleFlight::new()),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn authority(&self) -> &Arc<dyn IdentityAuthority> {
        &self.authority
    }

    /// Returns the cached credential when it is fresh and no refresh is forced;
    /// otherwise joins or starts a refresh of the same kind.
    ///
    /// A failed refresh leaves the cached credential in place unless the
    /// authority reports the principal as signed out.
    pub async fn get_token(&self, force_refresh: bool) -> Result<Credential, CredentialError> {
        let store = self.store.clone();
        let authority = self.authority.clone();
        let flight = if force_refresh {
            &self.forced
        } else {
            &self.refresh
        };
        flight
            .run(
                || {
                    if force_refresh {
                        None
                    } else {
                        self.store.fresh()
                    }
                },
                move || async move {
                    let epoch = store.epoch();
                    match authority.get_credential(force_refresh).await {
                        Ok(credential) => {
                            if store.replace(epoch, credential.clone()) {
                                info!(principal = %credential.principal().id, force_refresh, "credential refreshed");
                            } else {
                                warn!("credential store was cleared during refresh; result not cached");
                            }
                            Ok(credential)
                        }
                        Err(err) => {
                            if err.is_terminal() {
                                warn!(error = %err, "authority reports principal signed out");
                                store.clear();
                            } else {
                                warn!(error = %err, "credential refresh failed");
                            }
                            Err(err)
                        }
                    }
                },
            )
            .await
    }

    /// Drops the cached credential and detaches any running refresh.
    pub fn clear(&self) {
        self.store.clear();
        self.refresh.reset();
        self.forced.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::testkit::FakeAuthority;
    use futures::future::join_all;

    fn provider(authority: Arc<FakeAuthority>) -> TokenProvider {
        TokenProvider::new(authority, Arc::new(CredentialStore::in_memory()))
    }

    #[tokio::test]
    async fn fresh_credential_is_returned_without_io() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1"));
        let tokens = provider(authority.clone());

        let first = tokens.get_token(false).await.expect("first");
        let second = tokens.get_token(false).await.expect("second");

        assert_eq!(first, second);
        assert_eq!(authority.credential_calls(), 1);
    }

    #[tokio::test]
    async fn forced_refresh_always_reaches_the_authority() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1"));
        let tokens = provider(authority.clone());

        let first = tokens.get_token(false).await.expect("first");
        let forced = tokens.get_token(true).await.expect("forced");

        assert_ne!(first.token(), forced.token());
        assert_eq!(authority.credential_calls(), 2);
        assert_eq!(authority.forced_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_are_deduplicated() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1").gated());
        let tokens = provider(authority.clone());

        let callers = (0..6).map(|_| tokens.get_token(false));
        let release = async {
            tokio::task::yield_now().await;
            authority.release(1);
        };
        let (results, ()) = tokio::join!(join_all(callers), release);

        assert_eq!(authority.credential_calls(), 1);
        let tokens: Vec<_> = results
            .into_iter()
            .map(|result| result.expect("credential").token().to_string())
            .collect();
        assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn forced_refresh_does_not_join_unforced_flight() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1").gated());
        let store = Arc::new(CredentialStore::in_memory());
        store.replace(
            store.epoch(),
            Credential::new("rejected", Principal::new("user-1"), None),
        );
        store.mark_stale();
        let tokens = TokenProvider::new(authority.clone(), store);

        let release = async {
            while authority.credential_calls() < 2 {
                tokio::task::yield_now().await;
            }
            authority.release(2);
        };
        let (unforced, forced, ()) =
            tokio::join!(tokens.get_token(false), tokens.get_token(true), release);

        let unforced = unforced.expect("unforced");
        let forced = forced.expect("forced");
        assert_eq!(authority.credential_calls(), 2);
        assert_eq!(authority.forced_calls(), 1);
        assert_ne!(forced.token(), "rejected");
        assert_ne!(forced.token(), unforced.token());
    }

    #[tokio::test]
    async fn concurrent_forced_refreshes_share_one_call() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1").gated());
        let tokens = provider(authority.clone());

        let callers = (0..4).map(|_| tokens.get_token(true));
        let release = async {
            while authority.credential_calls() < 1 {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
            authority.release(4);
        };
        let (results, ()) = tokio::join!(join_all(callers), release);

        assert_eq!(authority.forced_calls(), 1);
        assert!(results.iter().all(|result| result.is_ok()));
    }

    #[tokio::test]
    async fn transient_failure_keeps_last_known_good_credential() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1"));
        let tokens = provider(authority.clone());
        let good = tokens.get_token(false).await.expect("initial");

        authority.fail_next(CredentialError::Authority("offline".into()));
        let err = tokens.get_token(true).await.expect_err("refresh fails");

        assert_eq!(err, CredentialError::Authority("offline".into()));
        assert_eq!(tokens.store().current(), Some(good));
    }

    #[tokio::test]
    async fn signed_out_failure_clears_cache() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1"));
        let tokens = provider(authority.clone());
        tokens.get_token(false).await.expect("initial");

        authority.fail_next(CredentialError::SignedOut("TOKEN_EXPIRED".into()));
        tokens.get_token(true).await.expect_err("signed out");

        assert!(tokens.store().current().is_none());
    }

    #[tokio::test]
    async fn stale_credential_triggers_refresh() {
        let authority = Arc::new(FakeAuthority::signed_in("user-1"));
        let store = Arc::new(CredentialStore::in_memory());
        store.replace(
            store.epoch(),
            Credential::new("old", Principal::new("user-1"), None),
        );
        store.mark_stale();
        let tokens = TokenProvider::new(authority.clone(), store);

        let credential = tokens.get_token(false).await.expect("refreshed");

        assert_ne!(credential.token(), "old");
        assert_eq!(authority.credential_calls(), 1);
    }
}

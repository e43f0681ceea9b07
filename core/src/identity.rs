//! The narrow capability set the transport needs from an identity provider.

use crate::auth::{Credential, Principal};
use crate::config::IdentitySettings;
use crate::error::CredentialError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub type PrincipalCallback = Arc<dyn Fn(Option<Principal>) + Send + Sync>;

/// External system of record for authentication.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    async fn sign_in(&self) -> Result<Principal, CredentialError>;

    fn current_principal(&self) -> Option<Principal>;

    fn on_principal_changed(&self, callback: PrincipalCallback) -> Subscription;

    async fn get_credential(&self, force_refresh: bool) -> Result<Credential, CredentialError>;
}

/// Unsubscribe handle returned by `on_principal_changed`. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Callback registry shared by authority implementations.
#[derive(Clone, Default)]
pub struct PrincipalWatchers {
    inner: Arc<Mutex<WatcherSet>>,
}

#[derive(Default)]
struct WatcherSet {
    next_id: u64,
    callbacks: HashMap<u64, PrincipalCallback>,
}

impl PrincipalWatchers {
    pub fn subscribe(&self, callback: PrincipalCallback) -> Subscription {
        let id = {
            let mut set = self.inner.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.callbacks.insert(id, callback);
            id
        };
        let weak: Weak<Mutex<WatcherSet>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().callbacks.remove(&id);
            }
        })
    }

    pub fn notify(&self, principal: Option<Principal>) {
        let callbacks: Vec<_> = self.inner.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(principal.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Error codes for which the identity service will never hand out a new token.
const SIGNED_OUT_CODES: &[&str] = &[
    "TOKEN_EXPIRED",
    "USER_DISABLED",
    "USER_NOT_FOUND",
    "INVALID_REFRESH_TOKEN",
    "INVALID_GRANT_TYPE",
];

struct AuthSession {
    principal: Principal,
    id_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl AuthSession {
    fn credential(&self) -> Credential {
        Credential::new(
            self.id_token.clone(),
            self.principal.clone(),
            Some(self.expires_at),
        )
    }

    fn is_valid(&self) -> bool {
        Utc::now() + Duration::minutes(1) < self.expires_at
    }
}

/// Email/password identity authority speaking the hosted identity-toolkit REST protocol:
/// password sign-in yields an id token plus a refresh token; the refresh token is
/// exchanged for new id tokens.
pub struct PasswordAuthority {
    settings: IdentitySettings,
    http: reqwest::Client,
    session: RwLock<Option<AuthSession>>,
    watchers: PrincipalWatchers,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    local_id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    user_id: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl PasswordAuthority {
    pub fn new(settings: IdentitySettings, http: reqwest::Client) -> Self {
        Self {
            settings,
            http,
            session: RwLock::new(None),
            watchers: PrincipalWatchers::default(),
        }
    }

    /// Forgets the local session and notifies watchers.
    pub fn sign_out(&self) {
        let had_session = self.session.write().take().is_some();
        if had_session {
            self.watchers.notify(None);
        }
    }

    async fn refresh(&self, refresh_token: String) -> Result<AuthSession, CredentialError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let response = self
            .http
            .post(self.settings.token_url.as_str())
            .query(&[("key", self.settings.api_key.as_str())])
            .form(&form)
            .send()
            .await
            .map_err(|err| CredentialError::Authority(err.to_string()))?;
        let body: RefreshResponse = decode_response(response).await?;
        let email = self
            .current_principal()
            .and_then(|principal| principal.email);
        Ok(AuthSession {
            principal: Principal {
                id: body.user_id,
                email,
            },
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_at: expiry_from(&body.expires_in),
        })
    }

    fn install(&self, session: AuthSession) -> Credential {
        let credential = session.credential();
        let changed = {
            let mut slot = self.session.write();
            let changed = slot.as_ref().map(|current| &current.principal) != Some(&session.principal);
            *slot = Some(session);
            changed
        };
        if changed {
            self.watchers.notify(Some(credential.principal().clone()));
        }
        credential
    }
}

#[async_trait]
impl IdentityAuthority for PasswordAuthority {
    async fn sign_in(&self) -> Result<Principal, CredentialError> {
        let (email, password) = match (&self.settings.email, &self.settings.password) {
            (Some(email), Some(password)) => (email.clone(), password.clone()),
            _ => {
                return Err(CredentialError::Authority(
                    "email and password are required to sign in".into(),
                ))
            }
        };
        let payload = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });
        let response = self
            .http
            .post(self.settings.sign_in_url.as_str())
            .query(&[("key", self.settings.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|err| CredentialError::Authority(err.to_string()))?;
        let body: SignInResponse = decode_response(response).await?;
        let mut principal = Principal::new(body.local_id);
        principal.email = body.email.or(Some(email));
        info!(principal = %principal.id, "signed in");
        self.install(AuthSession {
            principal: principal.clone(),
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_at: expiry_from(&body.expires_in),
        });
        Ok(principal)
    }

    fn current_principal(&self) -> Option<Principal> {
        self.session
            .read()
            .as_ref()
            .map(|session| session.principal.clone())
    }

    fn on_principal_changed(&self, callback: PrincipalCallback) -> Subscription {
        self.watchers.subscribe(callback)
    }

    async fn get_credential(&self, force_refresh: bool) -> Result<Credential, CredentialError> {
        let refresh_token = {
            let session = self.session.read();
            let session = session.as_ref().ok_or(CredentialError::NotSignedIn)?;
            if !force_refresh && session.is_valid() {
                return Ok(session.credential());
            }
            session.refresh_token.clone()
        };
        debug!(force_refresh, "exchanging refresh token");
        match self.refresh(refresh_token).await {
            Ok(session) => Ok(self.install(session)),
            Err(err) => {
                if err.is_terminal() {
                    warn!(error = %err, "refresh token rejected");
                    self.sign_out();
                }
                Err(err)
            }
        }
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CredentialError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| CredentialError::Authority(err.to_string()))?;
    if status.is_success() {
        return serde_json::from_slice(&bytes)
            .map_err(|err| CredentialError::Authority(format!("invalid response: {err}")));
    }
    let code = serde_json::from_slice::<ErrorEnvelope>(&bytes)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
    Err(classify_error(status.as_u16(), code))
}

fn classify_error(status: u16, code: String) -> CredentialError {
    // Codes may carry a suffix such as "TOKEN_EXPIRED : details".
    let head = code.split(':').next().unwrap_or_default().trim();
    if SIGNED_OUT_CODES.contains(&head) {
        CredentialError::SignedOut(head.to_string())
    } else {
        CredentialError::Authority(format!("{status}: {code}"))
    }
}

fn expiry_from(expires_in: &str) -> DateTime<Utc> {
    let seconds = expires_in.trim().parse::<i64>().unwrap_or(3600);
    Utc::now() + Duration::seconds(seconds)
}

use crate::store::CredentialFile;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Margin before `expires_at` at which a credential is already treated as stale.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The identity a credential was issued for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Short-lived bearer credential.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    token: String,
    principal: Principal,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    stale: bool,
}

impl Credential {
    pub fn new(
        token: impl Into<String>,
        principal: Principal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            token: token.into(),
            principal,
            expires_at,
            stale: false,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_fresh(&self) -> bool {
        if self.stale {
            return false;
        }
        match self.expires_at {
            Some(exp) => Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) < exp,
            None => true,
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("expires_at", &self.expires_at)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

/// Cache of the current credential, optionally mirrored to disk.
///
/// Every `clear` bumps an epoch; a refresh that started before the clear
/// cannot reinstall its result afterwards.
pub struct CredentialStore {
    state: RwLock<StoreState>,
    file: Option<CredentialFile>,
}

#[derive(Default)]
struct StoreState {
    current: Option<Credential>,
    epoch: u64,
}

impl CredentialStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            file: None,
        }
    }

    /// Opens the durable copy and seeds the cache from it.
    pub fn persistent(file: CredentialFile) -> Self {
        let current = match file.load() {
            Ok(current) => current,
            Err(err) => {
                warn!(error = ?err, path = %file.path().display(), "ignoring unreadable credential file");
                None
            }
        };
        Self {
            state: RwLock::new(StoreState { current, epoch: 0 }),
            file: Some(file),
        }
    }

    pub fn current(&self) -> Option<Credential> {
        self.state.read().current.clone()
    }

    pub fn fresh(&self) -> Option<Credential> {
        self.state
            .read()
            .current
            .as_ref()
            .filter(|credential| credential.is_fresh())
            .cloned()
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Installs `credential` unless the store was cleared since `epoch` was read.
    pub fn replace(&self, epoch: u64, credential: Credential) -> bool {
        let mut state = self.state.write();
        if state.epoch != epoch {
            return false;
        }
        if let Some(file) = &self.file {
            if let Err(err) = file.save(&credential) {
                error!(error = ?err, "failed to persist credential");
            }
        }
        state.current = Some(credential);
        true
    }

    pub fn mark_stale(&self) {
        if let Some(current) = self.state.write().current.as_mut() {
            current.stale = true;
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.current = None;
        state.epoch += 1;
        if let Some(file) = &self.file {
            if let Err(err) = file.remove() {
                error!(error = ?err, "failed to remove persisted credential");
            }
        }
    }
}

/// Broadcast to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedOut { reason: String },
}

type Resetter = Box<dyn Fn() + Send + Sync>;

/// Global sign-out side effect: resets every registered cache, then notifies subscribers.
#[derive(Clone)]
pub struct SignOutHook {
    inner: Arc<HookInner>,
}

struct HookInner {
    resetters: RwLock<Vec<Resetter>>,
    events: broadcast::Sender<AuthEvent>,
}

impl SignOutHook {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(HookInner {
                resetters: RwLock::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn on_sign_out(&self, resetter: impl Fn() + Send + Sync + 'static) {
        self.inner.resetters.write().push(Box::new(resetter));
    }

    pub fn sign_out(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "signing out");
        for resetter in self.inner.resetters.read().iter() {
            resetter();
        }
        // No subscriber is fine; the caches are already reset.
        let _ = self.inner.events.send(AuthEvent::SignedOut { reason });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for SignOutHook {
    fn default() -> Self {
        Self::new()
    }
}

use crate::error::{RequestError, SessionCreationError, TransportError};
use crate::http::AuthenticatedHttpClient;
use crate::singleflight::SingleFlight;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Server-side identifier scoping one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub tool_results: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fields of a session the owner may change; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Default)]
struct SessionCache {
    current: Option<SessionId>,
    epoch: u64,
}

/// Shared slot for the conversation's session id; cloned into sign-out resetters.
#[derive(Clone, Default)]
pub struct SessionSlot {
    inner: Arc<RwLock<SessionCache>>,
}

impl SessionSlot {
    pub fn current(&self) -> Option<SessionId> {
        self.inner.read().current.clone()
    }

    pub fn clear(&self) {
        let mut cache = self.inner.write();
        cache.current = None;
        cache.epoch += 1;
    }

    /// Installs an existing id, superseding any creation still in flight.
    pub fn adopt(&self, id: SessionId) {
        let mut cache = self.inner.write();
        cache.current = Some(id);
        cache.epoch += 1;
    }

    fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    fn install(&self, epoch: u64, id: SessionId) -> bool {
        let mut cache = self.inner.write();
        if cache.epoch != epoch {
            return false;
        }
        cache.current = Some(id);
        true
    }

    fn forget_if(&self, id: &SessionId) -> bool {
        let mut cache = self.inner.write();
        if cache.current.as_ref() != Some(id) {
            return false;
        }
        cache.current = None;
        cache.epoch += 1;
        true
    }
}

/// Lazily creates the conversation session, once, however many callers ask.
#[derive(Clone)]
pub struct SessionRegistry {
    client: AuthenticatedHttpClient,
    slot: SessionSlot,
    create: Arc<SingleFlight<SessionId, SessionCreationError>>,
}

impl SessionRegistry {
    pub fn new(client: AuthenticatedHttpClient) -> Self {
        Self {
            client,
            slot: SessionSlot::default(),
            create: Arc::new(SingleFlight::new()),
        }
    }

    pub fn slot(&self) -> &SessionSlot {
        &self.slot
    }

    pub fn current(&self) -> Option<SessionId> {
        self.slot.current()
    }

    /// Continues a conversation created earlier, e.g. by a previous process.
    pub fn adopt(&self, id: SessionId) {
        info!(session_id = %id, "resuming chat session");
        self.slot.adopt(id);
        self.create.reset();
    }

    /// Drops the cached id; the next `ensure_session` creates a new session.
    pub fn forget(&self) {
        self.slot.clear();
        self.create.reset();
    }

    pub async fn ensure_session(&self) -> Result<SessionId, SessionCreationError> {
        let client = self.client.clone();
        let slot = self.slot.clone();
        self.create
            .run(
                || self.slot.current(),
                move || async move {
                    let epoch = slot.epoch();
                    let record: SessionRecord = match client.post_json("sessions", &json!({})).await {
                        Ok(record) => record,
                        Err(err) => {
                            warn!(error = %err, "session creation failed");
                            return Err(SessionCreationError::from(err));
                        }
                    };
                    info!(session_id = %record.id, "chat session created");
                    if !slot.install(epoch, record.id.clone()) {
                        warn!(session_id = %record.id, "session cache was reset during creation; result not cached");
                    }
                    Ok(record.id)
                },
            )
            .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, RequestError> {
        self.client.get_json("sessions").await
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<SessionRecord, RequestError> {
        self.client
            .get_json(&format!("sessions/{}", id.as_str()))
            .await
    }

    pub async fn update_session(
        &self,
        id: &SessionId,
        update: &SessionUpdate,
    ) -> Result<SessionRecord, RequestError> {
        let body = serde_json::to_value(update)
            .map_err(|err| TransportError::Request(err.to_string()))?;
        self.client
            .put_json(&format!("sessions/{}", id.as_str()), &body)
            .await
    }

    pub async fn session_messages(&self, id: &SessionId) -> Result<Vec<MessageRecord>, RequestError> {
        self.client
            .get_json(&format!("sessions/{}/messages", id.as_str()))
            .await
    }

    pub async fn session_summary(&self, id: &SessionId) -> Result<SessionSummary, RequestError> {
        self.client
            .get_json(&format!("sessions/{}/summary", id.as_str()))
            .await
    }

    /// Every message the user has sent, across sessions.
    pub async fn all_user_messages(&self) -> Result<Vec<MessageRecord>, RequestError> {
        self.client.get_json("sessions/conversation").await
    }

    /// Closes a session to further chat; the active one is forgotten.
    pub async fn deactivate_session(&self, id: &SessionId) -> Result<(), RequestError> {
        let _: Value = self
            .client
            .post_json(&format!("sessions/{}/deactivate", id.as_str()), &json!({}))
            .await?;
        self.release(id, "deactivated the active session");
        Ok(())
    }

    pub async fn delete_session(&self, id: &SessionId) -> Result<(), RequestError> {
        self.client
            .delete(&format!("sessions/{}", id.as_str()))
            .await?;
        self.release(id, "deleted the active session");
        Ok(())
    }

    fn release(&self, id: &SessionId, message: &'static str) {
        if self.slot.forget_if(id) {
            self.create.reset();
            info!(session_id = %id, "{message}");
        }
    }
}

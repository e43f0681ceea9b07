//! In-process fakes for the identity authority and the backend.

use crate::auth::{Credential, Principal};
use crate::error::{ChatError, CredentialError, TransportError};
use crate::event::{Observer, StreamEvent};
use crate::http::{ByteStream, HttpBackend, HttpRequest, HttpResponse, AUTHORIZATION, IDEMPOTENCY_KEY};
use crate::identity::{IdentityAuthority, PrincipalCallback, PrincipalWatchers, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::channel::mpsc;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Semaphore;

/// Identity authority that issues a new token on every call.
pub struct FakeAuthority {
    principal: RwLock<Option<Principal>>,
    credential_calls: AtomicUsize,
    forced_calls: AtomicUsize,
    failures: Mutex<VecDeque<CredentialError>>,
    gate: Option<Semaphore>,
    watchers: PrincipalWatchers,
}

impl FakeAuthority {
    pub fn signed_in(principal: &str) -> Self {
        Self::with_principal(Some(Principal::new(principal)))
    }

    pub fn signed_out() -> Self {
        Self::with_principal(None)
    }

    fn with_principal(principal: Option<Principal>) -> Self {
        Self {
            principal: RwLock::new(principal),
            credential_calls: AtomicUsize::new(0),
            forced_calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            gate: None,
            watchers: PrincipalWatchers::default(),
        }
    }

    /// Every `get_credential` call waits for a permit from `release`.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn credential_calls(&self) -> usize {
        self.credential_calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> usize {
        self.forced_calls.load(Ordering::SeqCst)
    }

    /// The next `get_credential` call fails with `err`.
    pub fn fail_next(&self, err: CredentialError) {
        self.failures.lock().push_back(err);
    }

    pub fn sign_out(&self) {
        *self.principal.write() = None;
        self.watchers.notify(None);
    }
}

#[async_trait]
impl IdentityAuthority for FakeAuthority {
    async fn sign_in(&self) -> Result<Principal, CredentialError> {
        let principal = self
            .principal
            .read()
            .clone()
            .unwrap_or_else(|| Principal::new("fake-user"));
        *self.principal.write() = Some(principal.clone());
        self.watchers.notify(Some(principal.clone()));
        Ok(principal)
    }

    fn current_principal(&self) -> Option<Principal> {
        self.principal.read().clone()
    }

    fn on_principal_changed(&self, callback: PrincipalCallback) -> Subscription {
        self.watchers.subscribe(callback)
    }

    async fn get_credential(&self, force_refresh: bool) -> Result<Credential, CredentialError> {
        let call = self.credential_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if force_refresh {
            self.forced_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let failure = self.failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let principal = self.current_principal().ok_or(CredentialError::NotSignedIn)?;
        Ok(Credential::new(
            format!("token-{call}"),
            principal,
            Some(Utc::now() + Duration::hours(1)),
        ))
    }
}

/// What the scripted backend saw.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub idempotency_key: Option<String>,
    pub body: Option<Value>,
}

enum Reply {
    Body { status: u16, body: ByteStream },
    Fail(TransportError),
}

/// One canned reply for `ScriptedBackend`.
pub struct ScriptedResponse {
    reply: Reply,
}

impl ScriptedResponse {
    pub fn json(status: u16, value: Value) -> Self {
        let bytes = Bytes::from(value.to_string());
        Self::body(status, stream::iter([Ok(bytes)]).boxed())
    }

    pub fn status(status: u16) -> Self {
        Self::body(status, stream::empty().boxed())
    }

    pub fn body(status: u16, body: ByteStream) -> Self {
        Self {
            reply: Reply::Body { status, body },
        }
    }

    /// A 200 streaming reply that yields `chunks` in order, then ends.
    pub fn frames(chunks: &[&str]) -> (Self, ReleaseFlag) {
        let (body, released) = frame_body(chunks);
        (Self::body(200, body), released)
    }

    pub fn fail(err: TransportError) -> Self {
        Self {
            reply: Reply::Fail(err),
        }
    }
}

/// Backend that answers from per-route FIFO queues and records every request.
///
/// Unscripted routes answer 404.
#[derive(Default)]
pub struct ScriptedBackend {
    routes: Mutex<HashMap<(Method, String), VecDeque<ScriptedResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, path: &str, response: ScriptedResponse) {
        self.routes
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| &request.method == method && request.path == path)
            .count()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request.url.path().to_string();
        self.requests.lock().push(RecordedRequest {
            method: request.method.clone(),
            path: path.clone(),
            authorization: request.header(AUTHORIZATION).map(str::to_string),
            idempotency_key: request.header(IDEMPOTENCY_KEY).map(str::to_string),
            body: request
                .body
                .as_ref()
                .and_then(|body| serde_json::from_slice(body).ok()),
        });
        // Let concurrent callers reach the backend before anyone is answered.
        tokio::task::yield_now().await;

        let scripted = self
            .routes
            .lock()
            .get_mut(&(request.method.clone(), path))
            .and_then(VecDeque::pop_front);
        match scripted.map(|response| response.reply) {
            Some(Reply::Body { status, body }) => Ok(HttpResponse::new(status, body)),
            Some(Reply::Fail(err)) => Err(err),
            None => Ok(HttpResponse::new(404, stream::empty().boxed())),
        }
    }
}

/// Reports whether a body handed to the decoder has been dropped.
#[derive(Debug, Clone)]
pub struct ReleaseFlag {
    released: Arc<AtomicBool>,
}

impl ReleaseFlag {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

struct TrackedBody {
    inner: ByteStream,
    released: Arc<AtomicBool>,
    delivered: Arc<AtomicUsize>,
}

impl Stream for TrackedBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(Ok(_))) = &poll {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        poll
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

fn tracked(inner: ByteStream) -> (ByteStream, ReleaseFlag, Arc<AtomicUsize>) {
    let released = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(AtomicUsize::new(0));
    let body = TrackedBody {
        inner,
        released: released.clone(),
        delivered: delivered.clone(),
    };
    (body.boxed(), ReleaseFlag { released }, delivered)
}

/// A body that yields `chunks` and ends.
pub fn frame_body(chunks: &[&str]) -> (ByteStream, ReleaseFlag) {
    let chunks: Vec<Result<Bytes, TransportError>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk.as_bytes())))
        .collect();
    let (body, released, _) = tracked(stream::iter(chunks).boxed());
    (body, released)
}

/// Test-side writer for `chunked_body`.
pub struct ChunkFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    delivered: Arc<AtomicUsize>,
}

impl ChunkFeed {
    pub fn send(&self, chunk: &str) {
        let _ = self
            .tx
            .unbounded_send(Ok(Bytes::copy_from_slice(chunk.as_bytes())));
    }

    pub fn fail(&self, err: TransportError) {
        let _ = self.tx.unbounded_send(Err(err));
    }

    /// Ends the body.
    pub fn close(&self) {
        self.tx.close_channel();
    }

    /// Chunks the reader has pulled so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

/// A body fed chunk by chunk from the test, for interleaving reads with cancellation.
pub fn chunked_body() -> (ByteStream, ReleaseFlag, ChunkFeed) {
    let (tx, rx) = mpsc::unbounded();
    let (body, released, delivered) = tracked(rx.boxed());
    (body, released, ChunkFeed { tx, delivered })
}

/// Observer that keeps every call for later assertions.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub events: Vec<StreamEvent>,
    pub errors: Vec<ChatError>,
    pub completions: usize,
}

impl RecordingObserver {
    /// Concatenated deltas.
    pub fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| event.delta.as_deref())
            .collect()
    }

    pub fn is_silent(&self) -> bool {
        self.events.is_empty() && self.errors.is_empty() && self.completions == 0
    }
}

impl Observer for RecordingObserver {
    fn next(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    fn error(&mut self, cause: ChatError) {
        self.errors.push(cause);
    }

    fn complete(&mut self) {
        self.completions += 1;
    }
}

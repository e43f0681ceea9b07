use crate::auth::{AuthEvent, CredentialStore, SignOutHook};
use crate::config::ClientSettings;
use crate::decoder::{DecodeOutcome, DecoderOptions, StreamDecoder};
use crate::error::{ChatError, TransportError};
use crate::event::{ChannelObserver, Observer, ObserverGuard, StreamMessage};
use crate::http::{AuthenticatedHttpClient, HttpBackend, ReqwestBackend};
use crate::identity::IdentityAuthority;
use crate::session::SessionRegistry;
use crate::state::{abort_pair, AbortHandle, AbortSignal, ChatPhase, PhaseTracker};
use crate::store::CredentialFile;
use crate::token::TokenProvider;
use reqwest::Method;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: Url,
    pub decoder: DecoderOptions,
    /// Deadline for buffered calls such as session creation. Chat streams are not bounded.
    pub request_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            decoder: DecoderOptions::default(),
            request_timeout: None,
        }
    }
}

/// "Send a message, receive its event stream."
///
/// Cloning is cheap; clones share the credential, the session and the sign-out hook.
#[derive(Clone)]
pub struct ChatTransport {
    client: AuthenticatedHttpClient,
    sessions: SessionRegistry,
    decoder: StreamDecoder,
}

impl ChatTransport {
    pub fn new(
        authority: Arc<dyn IdentityAuthority>,
        backend: Arc<dyn HttpBackend>,
        store: Arc<CredentialStore>,
        config: TransportConfig,
    ) -> Self {
        let hook = SignOutHook::new();
        let tokens = TokenProvider::new(authority, store);
        let mut client =
            AuthenticatedHttpClient::new(backend, tokens.clone(), config.base_url, hook.clone());
        if let Some(timeout) = config.request_timeout {
            client = client.with_timeout(timeout);
        }
        let sessions = SessionRegistry::new(client.clone());

        hook.on_sign_out(move || tokens.clear());
        let slot = sessions.slot().clone();
        hook.on_sign_out(move || slot.clear());

        Self {
            client,
            sessions,
            decoder: StreamDecoder::new(config.decoder),
        }
    }

    /// Wires the reqwest backend and the durable credential cache from `settings`.
    pub fn connect(
        settings: &ClientSettings,
        authority: Arc<dyn IdentityAuthority>,
    ) -> Result<Self, TransportError> {
        let backend = Arc::new(ReqwestBackend::new(settings.request_timeout)?);
        let file = settings
            .credential_cache
            .clone()
            .map(CredentialFile::new)
            .unwrap_or_else(CredentialFile::default_location);
        let store = Arc::new(CredentialStore::persistent(file));
        let config = TransportConfig {
            base_url: settings.api_base_url.clone(),
            decoder: DecoderOptions {
                require_terminal_frame: settings.stream.require_terminal_frame,
            },
            request_timeout: Some(settings.request_timeout),
        };
        Ok(Self::new(authority, backend, store, config))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenProvider {
        self.client.tokens()
    }

    pub fn client(&self) -> &AuthenticatedHttpClient {
        &self.client
    }

    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.client.sign_out_hook().subscribe()
    }

    /// Clears the credential and the session, then notifies `auth_events` subscribers.
    pub fn sign_out(&self, reason: impl Into<String>) {
        self.client.sign_out_hook().sign_out(reason);
    }

    /// Runs one chat interaction to its terminal phase, reporting events to `observer`.
    pub async fn send_message<O: Observer>(
        &self,
        text: &str,
        observer: O,
        abort: AbortSignal,
    ) -> ChatPhase {
        self.drive(text, observer, abort, &PhaseTracker::new()).await
    }

    /// Spawns the interaction and hands back its events as a channel.
    pub fn start_message(&self, text: impl Into<String>) -> ChatStream {
        let (observer, messages) = ChannelObserver::new();
        let (abort, signal) = abort_pair();
        let phase = PhaseTracker::new();
        let phase_rx = phase.subscribe();
        let transport = self.clone();
        let text = text.into();
        let task =
            tokio::spawn(async move { transport.drive(&text, observer, signal, &phase).await });
        ChatStream {
            messages,
            abort,
            phase: phase_rx,
            task: Some(task),
        }
    }

    async fn drive<O: Observer>(
        &self,
        text: &str,
        observer: O,
        abort: AbortSignal,
        phase: &PhaseTracker,
    ) -> ChatPhase {
        let interaction_id = Uuid::new_v4();
        let span = info_span!("chat", %interaction_id);
        self.interact(text, ObserverGuard::new(observer), abort, phase)
            .instrument(span)
            .await
    }

    async fn interact<O: Observer>(
        &self,
        text: &str,
        mut observer: ObserverGuard<O>,
        mut abort: AbortSignal,
        phase: &PhaseTracker,
    ) -> ChatPhase {
        if text.trim().is_empty() {
            let cause = TransportError::Request("message is empty".into());
            return fail(&mut observer, phase, cause.into());
        }

        let session = match or_abort(&mut abort, self.sessions.ensure_session()).await {
            None => return cancel(&mut observer, phase),
            Some(Ok(session)) => session,
            Some(Err(err)) => return fail(&mut observer, phase, err.into()),
        };
        phase.advance(ChatPhase::AwaitingCredential);

        let credential = match or_abort(&mut abort, self.client.authorize()).await {
            None => return cancel(&mut observer, phase),
            Some(Ok(credential)) => credential,
            Some(Err(err)) => return fail(&mut observer, phase, err.into()),
        };
        phase.advance(ChatPhase::Requesting);

        let body = json!({ "content": text, "metadata": {} });
        let path = format!("sessions/{}/chat", session.as_str());
        let request = match self.client.prepare(Method::POST, &path, Some(&body)) {
            Ok(request) => request,
            Err(err) => return fail(&mut observer, phase, err.into()),
        };
        let response = match or_abort(&mut abort, self.client.execute(credential, request)).await {
            None => return cancel(&mut observer, phase),
            Some(Ok(response)) => response,
            Some(Err(err)) => return fail(&mut observer, phase, err.into()),
        };
        let response = match or_abort(&mut abort, response.error_for_status()).await {
            None => return cancel(&mut observer, phase),
            Some(Ok(response)) => response,
            Some(Err(err)) => return fail(&mut observer, phase, err.into()),
        };
        phase.advance(ChatPhase::Streaming);
        info!(session_id = %session, "streaming response");

        match self
            .decoder
            .decode(response.into_body(), &mut observer, &mut abort)
            .await
        {
            DecodeOutcome::Completed { frames } => {
                info!(frames, "response complete");
                phase.advance(ChatPhase::Completed);
            }
            DecodeOutcome::Failed(_) => {
                phase.advance(ChatPhase::Failed);
            }
            DecodeOutcome::Canceled => {
                phase.advance(ChatPhase::Canceled);
            }
        }
        phase.current()
    }
}

/// `None` when abort fired first; `work` is dropped unfinished.
async fn or_abort<F: Future>(abort: &mut AbortSignal, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        output = work => Some(output),
    }
}

fn cancel<O: Observer>(observer: &mut ObserverGuard<O>, phase: &PhaseTracker) -> ChatPhase {
    info!("chat canceled");
    observer.silence();
    phase.advance(ChatPhase::Canceled);
    ChatPhase::Canceled
}

fn fail<O: Observer>(
    observer: &mut ObserverGuard<O>,
    phase: &PhaseTracker,
    cause: ChatError,
) -> ChatPhase {
    error!(error = %cause, phase = ?phase.current(), "chat failed");
    observer.error(cause);
    phase.advance(ChatPhase::Failed);
    ChatPhase::Failed
}

/// A running interaction started by `ChatTransport::start_message`.
///
/// Dropping the stream cancels the interaction.
pub struct ChatStream {
    messages: mpsc::UnboundedReceiver<StreamMessage>,
    abort: AbortHandle,
    phase: watch::Receiver<ChatPhase>,
    task: Option<JoinHandle<ChatPhase>>,
}

impl ChatStream {
    /// The next observer call, in order; `None` once the interaction has ended.
    pub async fn next_message(&mut self) -> Option<StreamMessage> {
        self.messages.recv().await
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn phase(&self) -> ChatPhase {
        *self.phase.borrow()
    }

    pub fn phase_updates(&self) -> watch::Receiver<ChatPhase> {
        self.phase.clone()
    }

    /// Waits for the interaction to finish and returns its terminal phase.
    pub async fn wait(mut self) -> ChatPhase {
        let Some(task) = self.task.take() else {
            return self.phase();
        };
        match task.await {
            Ok(phase) => phase,
            Err(err) => {
                error!(error = %err, "chat task ended abnormally");
                ChatPhase::Failed
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            self.abort.abort();
        }
    }
}

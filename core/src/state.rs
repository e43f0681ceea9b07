use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of a single chat interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    AwaitingSession,
    AwaitingCredential,
    Requesting,
    Streaming,
    Completed,
    Failed,
    Canceled,
}

impl ChatPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Forward steps are strictly ordered; `Failed` and `Canceled` are reachable
    /// from every non-terminal phase; terminal phases never move.
    pub fn can_advance_to(self, next: ChatPhase) -> bool {
        use ChatPhase::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Failed) | (_, Canceled) => true,
            (AwaitingSession, AwaitingCredential)
            | (AwaitingCredential, Requesting)
            | (Requesting, Streaming)
            | (Streaming, Completed) => true,
            _ => false,
        }
    }
}

/// Publishes the phase of one interaction and rejects illegal transitions.
pub struct PhaseTracker {
    tx: watch::Sender<ChatPhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ChatPhase::AwaitingSession);
        Self { tx }
    }

    pub fn current(&self) -> ChatPhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatPhase> {
        self.tx.subscribe()
    }

    pub fn advance(&self, next: ChatPhase) -> bool {
        let current = self.current();
        if !current.can_advance_to(next) {
            warn!(?current, ?next, "ignoring illegal chat phase transition");
            return false;
        }
        debug!(from = ?current, to = ?next, "chat phase");
        self.tx.send_replace(next);
        true
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests cancellation of a running interaction.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observed by the interaction at each suspension point.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        abort_pair().1
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort is requested; never resolves if every handle is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

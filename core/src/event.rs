use crate::error::ChatError;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// One frame of the chat response stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Incremental assistant text. Backends that send `content` instead are accepted.
    #[serde(
        default,
        alias = "content",
        deserialize_with = "text_delta",
        skip_serializing_if = "Option::is_none"
    )]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "done_flag")]
    pub done: bool,
    /// Every other field of the frame, untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// Accepts a plain string, or a structured content object whose `parts[].text` are joined.
fn text_delta<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Object(object)) => {
            let text: String = object
                .get("parts")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    })
}

/// Terminal frames arrive both as `"done": true` and as `"done": "true"`.
fn done_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(flag),
        Some(Value::String(text)) if text.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(text)) if text.eq_ignore_ascii_case("false") => Ok(false),
        Some(other) => Err(de::Error::custom(format!("invalid `done` value: {other}"))),
    }
}

/// Receives the decoded events of one chat stream.
///
/// `next` may be called many times; `error` and `complete` at most once between
/// them, and nothing follows either.
pub trait Observer: Send {
    fn next(&mut self, event: StreamEvent);
    fn error(&mut self, cause: ChatError);
    fn complete(&mut self);
}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn next(&mut self, event: StreamEvent) {
        (**self).next(event)
    }

    fn error(&mut self, cause: ChatError) {
        (**self).error(cause)
    }

    fn complete(&mut self) {
        (**self).complete()
    }
}

impl<O: Observer + ?Sized> Observer for Box<O> {
    fn next(&mut self, event: StreamEvent) {
        (**self).next(event)
    }

    fn error(&mut self, cause: ChatError) {
        (**self).error(cause)
    }

    fn complete(&mut self) {
        (**self).complete()
    }
}

/// Enforces the single-terminal-call contract around any observer.
pub struct ObserverGuard<O> {
    inner: O,
    finished: bool,
}

impl<O: Observer> ObserverGuard<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stops all further delivery without a terminal call (cancellation).
    pub fn silence(&mut self) {
        self.finished = true;
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<O: Observer> Observer for ObserverGuard<O> {
    fn next(&mut self, event: StreamEvent) {
        if !self.finished {
            self.inner.next(event);
        }
    }

    fn error(&mut self, cause: ChatError) {
        if !self.finished {
            self.finished = true;
            self.inner.error(cause);
        }
    }

    fn complete(&mut self) {
        if !self.finished {
            self.finished = true;
            self.inner.complete();
        }
    }
}

/// Observer calls as a tagged message, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Next(StreamEvent),
    Error(ChatError),
    Complete,
}

impl StreamMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Complete)
    }
}

/// Forwards observer calls into an unbounded channel.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<StreamMessage>,
}

impl ChannelObserver {
    pub fn new() -> (Self, UnboundedReceiver<StreamMessage>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn next(&mut self, event: StreamEvent) {
        let _ = self.tx.send(StreamMessage::Next(event));
    }

    fn error(&mut self, cause: ChatError) {
        let _ = self.tx.send(StreamMessage::Error(cause));
    }

    fn complete(&mut self) {
        let _ = self.tx.send(StreamMessage::Complete);
    }
}

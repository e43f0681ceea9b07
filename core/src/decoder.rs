use crate::error::{ChatError, DecodeError};
use crate::event::{Observer, ObserverGuard, StreamEvent};
use crate::http::ByteStream;
use crate::state::AbortSignal;
use futures::StreamExt;
use tracing::{debug, warn};

/// Splits a byte stream of concatenated JSON objects into events.
///
/// Frames may be split across chunks at any byte, and several frames may share
/// one chunk. Incomplete trailing bytes are held until the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every frame it completed, in order.
    ///
    /// Frames ahead of a syntax error are still returned. Once `error` is set
    /// the decoder must not be fed again.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Decoded {
        self.buf.extend_from_slice(chunk);
        let mut decoded = Decoded::default();
        let consumed = {
            let mut frames =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<StreamEvent>();
            loop {
                match frames.next() {
                    Some(Ok(event)) => decoded.events.push(event),
                    // Partial frame: restart from its first byte once more data arrives.
                    Some(Err(err)) if err.is_eof() => break frames.byte_offset(),
                    Some(Err(err)) => {
                        decoded.error = Some(DecodeError::Malformed(err.to_string()));
                        break frames.byte_offset();
                    }
                    None => break frames.byte_offset(),
                }
            }
        };
        self.buf.drain(..consumed);
        decoded
    }

    /// Bytes of an unfinished frame still waiting for input.
    pub fn pending(&self) -> usize {
        self.buf
            .iter()
            .filter(|byte| !byte.is_ascii_whitespace())
            .count()
    }

    /// Called at end of input; leftover bytes mean the last frame was cut off.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.pending() {
            0 => Ok(()),
            pending => Err(DecodeError::Truncated { pending }),
        }
    }
}

/// Output of `FrameDecoder::push_chunk`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub events: Vec<StreamEvent>,
    pub error: Option<DecodeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Treat end of input without a `done` frame as an error.
    pub require_terminal_frame: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            require_terminal_frame: true,
        }
    }
}

/// How one decode run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Completed { frames: usize },
    Failed(ChatError),
    Canceled,
}

/// Drives a response body into an observer until a terminal condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamDecoder {
    options: DecoderOptions,
}

impl StreamDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> DecoderOptions {
        self.options
    }

    /// Reads `body` to the end, delivering each frame to `observer` in order.
    ///
    /// Exactly one of `complete` or `error` reaches the observer unless `abort`
    /// fires first, in which case the observer hears nothing more. The body is
    /// dropped on every exit, releasing the connection.
    pub async fn decode<O: Observer>(
        &self,
        mut body: ByteStream,
        observer: &mut ObserverGuard<O>,
        abort: &mut AbortSignal,
    ) -> DecodeOutcome {
        let mut frames = FrameDecoder::new();
        let mut delivered = 0usize;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    drop(body);
                    return cancel(observer, delivered);
                }
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    let Decoded { events, error } = frames.push_chunk(&bytes);
                    for event in events {
                        if abort.is_aborted() {
                            drop(body);
                            return cancel(observer, delivered);
                        }
                        let done = event.done;
                        observer.next(event);
                        delivered += 1;
                        if done {
                            drop(body);
                            debug!(frames = delivered, "stream completed");
                            observer.complete();
                            return DecodeOutcome::Completed { frames: delivered };
                        }
                    }
                    if let Some(err) = error {
                        drop(body);
                        return fail(observer, err.into());
                    }
                }
                Some(Err(err)) => {
                    drop(body);
                    return fail(observer, err.into());
                }
                None => {
                    if let Err(err) = frames.finish() {
                        return fail(observer, err.into());
                    }
                    if self.options.require_terminal_frame {
                        return fail(observer, DecodeError::MissingTerminalFrame.into());
                    }
                    debug!(frames = delivered, "stream ended without terminal frame");
                    observer.complete();
                    return DecodeOutcome::Completed { frames: delivered };
                }
            }
        }
    }
}

fn cancel<O: Observer>(observer: &mut ObserverGuard<O>, delivered: usize) -> DecodeOutcome {
    debug!(frames = delivered, "stream canceled");
    observer.silence();
    DecodeOutcome::Canceled
}

fn fail<O: Observer>(observer: &mut ObserverGuard<O>, cause: ChatError) -> DecodeOutcome {
    warn!(error = %cause, "stream failed");
    observer.error(cause.clone());
    DecodeOutcome::Failed(cause)
}

use crate::api::{Backend, ChatRequest};
use crate::conversation::{SharedConversation, TurnHandle};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shown in place of the reply whenever an exchange breaks.
pub const CONNECTION_ERROR: &str = "Sorry, a connection error occurred.";
/// Replaces a partial reply whose stream was cancelled.
pub const INTERRUPTED: &str = "(reply interrupted)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The full reply text.
    Completed(String),
    /// The exchange broke; the reply slot now holds [`CONNECTION_ERROR`].
    Failed(String),
    /// Reading stopped early, either on request or because the conversation
    /// was reset underneath the exchange. A reply slot that still belongs to
    /// the conversation holds [`INTERRUPTED`].
    Cancelled,
}

/// Runs one streamed chat exchange at a time into a conversation.
pub struct StreamConsumer<B: Backend> {
    backend: Arc<B>,
    timeout: Option<Duration>,
}

impl<B: Backend> StreamConsumer<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append a placeholder assistant turn and fill it from the reply stream.
    ///
    /// `on_update` sees the whole reply so far after every increment, starting
    /// with the empty placeholder. Callers must not start a second exchange on
    /// the same conversation before this one resolves.
    pub async fn send(
        &self,
        conversation: &SharedConversation,
        request: &ChatRequest,
        cancel: &CancellationToken,
        mut on_update: impl FnMut(&str),
    ) -> StreamOutcome {
        let exchange_id = Uuid::new_v4();
        let handle = conversation.lock().append_assistant_placeholder();
        on_update("");

        let deadline = self.timeout.map(|t| Instant::now() + t);
        debug!(%exchange_id, history = request.history.len(), file_id = ?request.file_id, "opening chat stream");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return interrupt(conversation, handle, exchange_id, &mut on_update),
            _ = wait_until(deadline) => Err("timed out waiting for the reply".to_string()),
            opened = self.backend.chat(request) => opened.map_err(|e| e.to_string()),
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return fail(conversation, handle, exchange_id, e, &mut on_update),
        };

        let mut decoder = Utf8Decoder::default();
        let mut reply = String::new();
        let mut increments = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%exchange_id, increments, "chat stream cancelled");
                    return interrupt(conversation, handle, exchange_id, &mut on_update);
                }
                _ = wait_until(deadline) => Some(Err("timed out while reading the reply".to_string())),
                next = stream.next() => next.map(|chunk| chunk.map_err(|e| e.to_string())),
            };

            match next {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    increments += 1;
                    reply.push_str(&text);
                    if !publish(conversation, handle, &reply, &mut on_update) {
                        debug!(%exchange_id, "conversation moved on, dropping stream");
                        return StreamOutcome::Cancelled;
                    }
                }
                Some(Err(e)) => return fail(conversation, handle, exchange_id, e, &mut on_update),
                None => {
                    let tail = decoder.finish();
                    if !tail.is_empty() {
                        reply.push_str(&tail);
                        if !publish(conversation, handle, &reply, &mut on_update) {
                            return StreamOutcome::Cancelled;
                        }
                    }
                    info!(%exchange_id, increments, chars = reply.chars().count(), "chat reply complete");
                    return StreamOutcome::Completed(reply);
                }
            }
        }
    }
}

fn publish(
    conversation: &SharedConversation,
    handle: TurnHandle,
    text: &str,
    on_update: &mut impl FnMut(&str),
) -> bool {
    // The lock is released before the callback runs.
    let written = conversation.lock().replace(handle, text);
    if written {
        on_update(text);
    }
    written
}

fn fail(
    conversation: &SharedConversation,
    handle: TurnHandle,
    exchange_id: Uuid,
    error: String,
    on_update: &mut impl FnMut(&str),
) -> StreamOutcome {
    warn!(%exchange_id, %error, "chat stream failed");
    if publish(conversation, handle, CONNECTION_ERROR, on_update) {
        StreamOutcome::Failed(error)
    } else {
        StreamOutcome::Cancelled
    }
}

fn interrupt(
    conversation: &SharedConversation,
    handle: TurnHandle,
    exchange_id: Uuid,
    on_update: &mut impl FnMut(&str),
) -> StreamOutcome {
    if publish(conversation, handle, INTERRUPTED, on_update) {
        debug!(%exchange_id, "partial reply marked as interrupted");
    }
    StreamOutcome::Cancelled
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Incremental UTF-8 decoding. A code point split across chunks is held back
/// until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

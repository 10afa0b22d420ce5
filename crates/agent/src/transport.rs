//! Conversation transport: one streaming exchange as a single await.
//!
//! [`ConversationTransport::send`] subscribes to the exchange's fragment,
//! completion and error commands on the bridge, posts the request, and
//! forwards every fragment to an [`ExchangeObserver`] until the stream ends.

use std::sync::Arc;

use chatloop_core::bridge::{commands, ListenerId, ListenerOptions, MessageBridge};
use chatloop_core::error::{ErrorReport, TaskLoopError};
use chatloop_core::provider::{ChatRequest, StreamChunk};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Receives the events of one exchange, in arrival order.
pub trait ExchangeObserver {
    fn on_chunk(&self, chunk: &StreamChunk);

    fn on_done(&self);

    fn on_error(&self, report: ErrorReport);
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed,
    Failed(String),
}

impl ExchangeOutcome {
    /// Whether the loop must stop after this epoch.
    pub fn stop(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One event of an exchange, as seen by its subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Chunk(StreamChunk),
    Done,
    Error(String),
}

#[derive(Deserialize)]
struct ChunkPayload {
    id: String,
    chunk: StreamChunk,
}

#[derive(Deserialize)]
struct EndPayload {
    id: String,
    #[serde(default)]
    message: Option<String>,
}

/// The fragment, completion and error listeners of one exchange, owned as a
/// unit. `close()` removes all three exactly once; dropping closes too.
pub struct ExchangeSubscription {
    bridge: Arc<MessageBridge>,
    listeners: Option<[ListenerId; 3]>,
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
}

impl ExchangeSubscription {
    /// Subscribe to events whose payload `id` equals `exchange_id`.
    pub fn open(bridge: Arc<MessageBridge>, exchange_id: &str) -> Self {
        let (tx, events) = mpsc::unbounded_channel();

        let chunk_id = {
            let (tx, exchange_id) = (tx.clone(), exchange_id.to_string());
            bridge.add_command_listener(
                commands::CHUNK,
                move |data| match serde_json::from_value::<ChunkPayload>(data.clone()) {
                    Ok(payload) if payload.id == exchange_id => {
                        let _ = tx.send(ExchangeEvent::Chunk(payload.chunk));
                    }
                    Ok(_) => {}
                    Err(e) => trace!(error = %e, "Ignoring malformed chunk payload"),
                },
                ListenerOptions { once: false },
            )
        };

        let done_id = {
            let (tx, exchange_id) = (tx.clone(), exchange_id.to_string());
            bridge.add_command_listener(
                commands::DONE,
                move |data| {
                    if end_matches(data, &exchange_id).is_some() {
                        let _ = tx.send(ExchangeEvent::Done);
                    }
                },
                ListenerOptions { once: false },
            )
        };

        let error_id = {
            let exchange_id = exchange_id.to_string();
            bridge.add_command_listener(
                commands::ERROR,
                move |data| {
                    if let Some(message) = end_matches(data, &exchange_id) {
                        let message =
                            message.unwrap_or_else(|| "Model service request failed".to_string());
                        let _ = tx.send(ExchangeEvent::Error(message));
                    }
                },
                ListenerOptions { once: false },
            )
        };

        Self {
            bridge,
            listeners: Some([chunk_id, done_id, error_id]),
            events,
        }
    }

    /// Next event, or `None` once closed and drained.
    pub async fn next(&mut self) -> Option<ExchangeEvent> {
        self.events.recv().await
    }

    /// Remove all three listeners. Later calls are no-ops.
    pub fn close(&mut self) {
        if let Some(ids) = self.listeners.take() {
            for id in ids {
                self.bridge.remove_listener(id);
            }
            self.events.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.is_none()
    }
}

impl Drop for ExchangeSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// `Some(message)` when an end payload belongs to `exchange_id`.
fn end_matches(data: &serde_json::Value, exchange_id: &str) -> Option<Option<String>> {
    match serde_json::from_value::<EndPayload>(data.clone()) {
        Ok(payload) if payload.id == exchange_id => Some(payload.message),
        Ok(_) => None,
        Err(e) => {
            trace!(error = %e, "Ignoring malformed end payload");
            None
        }
    }
}

/// Sends exchanges over a [`MessageBridge`].
#[derive(Clone)]
pub struct ConversationTransport {
    bridge: Arc<MessageBridge>,
}

impl ConversationTransport {
    pub fn new(bridge: Arc<MessageBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<MessageBridge> {
        &self.bridge
    }

    /// Run one exchange to its end.
    ///
    /// Fragments reach `observer.on_chunk` in arrival order. Completion calls
    /// `on_done`; a stream error (or a bridge that cannot deliver) calls
    /// `on_error` and yields [`ExchangeOutcome::Failed`].
    pub async fn send<O>(&self, request: &ChatRequest, observer: &O) -> ExchangeOutcome
    where
        O: ExchangeObserver + ?Sized,
    {
        let mut subscription = ExchangeSubscription::open(self.bridge.clone(), &request.id);

        let posted = serde_json::to_value(request)
            .map_err(|e| e.to_string())
            .and_then(|data| {
                self.bridge
                    .post_message(commands::CHAT_COMPLETIONS, data)
                    .map_err(|e| e.to_string())
            });
        if let Err(reason) = posted {
            subscription.close();
            return Self::fail(observer, reason);
        }

        debug!(exchange_id = %request.id, model = %request.request.model, "Exchange submitted");

        while let Some(event) = subscription.next().await {
            match event {
                ExchangeEvent::Chunk(chunk) => observer.on_chunk(&chunk),
                ExchangeEvent::Done => {
                    subscription.close();
                    debug!(exchange_id = %request.id, "Exchange completed");
                    observer.on_done();
                    return ExchangeOutcome::Completed;
                }
                ExchangeEvent::Error(message) => {
                    subscription.close();
                    return Self::fail(observer, message);
                }
            }
        }

        subscription.close();
        Self::fail(observer, "exchange channel closed before the stream ended".to_string())
    }

    /// Ask the backend to cancel `exchange_id`. The pending `send` still
    /// resolves through the backend's completion or error event.
    pub fn abort(&self, exchange_id: &str) {
        if let Err(e) = self
            .bridge
            .post_message(commands::ABORT, serde_json::json!({ "id": exchange_id }))
        {
            warn!(exchange_id, error = %e, "Failed to post abort");
        }
    }

    fn fail<O>(observer: &O, reason: String) -> ExchangeOutcome
    where
        O: ExchangeObserver + ?Sized,
    {
        let err = TaskLoopError::Transport(reason.clone());
        warn!(error = %err, "Exchange failed");
        observer.on_error(ErrorReport::from(&err));
        ExchangeOutcome::Failed(reason)
    }
}

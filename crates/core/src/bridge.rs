//! Command message bridge: the channel between the task loop and the backend.
//!
//! Outbound messages (`post_message`) go onto a queue read by a host; inbound
//! messages (`dispatch`) are routed to listeners registered per command.
//! Handlers run outside the registry lock, so a handler may add or remove
//! listeners, and for a given caller of `dispatch` they run in arrival order.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::BridgeError;

/// Command names used on the bridge.
pub mod commands {
    /// Submit a `ChatRequest` for streaming.
    pub const CHAT_COMPLETIONS: &str = "llm/chat/completions";
    /// One fragment: `{id, chunk}`.
    pub const CHUNK: &str = "llm/chat/completions/chunk";
    /// Stream finished: `{id}`.
    pub const DONE: &str = "llm/chat/completions/done";
    /// Stream failed: `{id, message}`.
    pub const ERROR: &str = "llm/chat/completions/error";
    /// Cancel an exchange: `{id}`.
    pub const ABORT: &str = "llm/chat/completions/abort";
}

/// A command and its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub command: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl BridgeMessage {
    pub fn new(command: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// Handle returned by [`MessageBridge::add_command_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// Remove the listener after its first delivery.
    pub once: bool,
}

type Handler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

struct Listener {
    id: ListenerId,
    command: String,
    once: bool,
    handler: Handler,
}

/// The command bridge.
pub struct MessageBridge {
    outbound: mpsc::UnboundedSender<BridgeMessage>,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl MessageBridge {
    /// Create a bridge and the receiver a host reads outbound messages from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            outbound,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        };
        (bridge, rx)
    }

    /// Fire-and-forget send towards the host.
    pub fn post_message(
        &self,
        command: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), BridgeError> {
        self.outbound
            .send(BridgeMessage::new(command, data))
            .map_err(|_| BridgeError::Closed)
    }

    /// Register `handler` for inbound messages carrying `command`.
    pub fn add_command_listener<F>(
        &self,
        command: impl Into<String>,
        handler: F,
        options: ListenerOptions,
    ) -> ListenerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Listener {
            id,
            command: command.into(),
            once: options.once,
            handler: Arc::new(handler),
        };
        self.lock().push(listener);
        id
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Deliver an inbound message. Returns how many handlers ran.
    pub fn dispatch(&self, message: &BridgeMessage) -> usize {
        let handlers: Vec<Handler> = {
            let mut listeners = self.lock();
            let matching: Vec<Handler> = listeners
                .iter()
                .filter(|l| l.command == message.command)
                .map(|l| l.handler.clone())
                .collect();
            listeners.retain(|l| !(l.once && l.command == message.command));
            matching
        };

        for handler in &handlers {
            handler(&message.data);
        }
        handlers.len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        // A panicking handler never holds the lock, so poisoning is benign.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&serde_json::Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &serde_json::Value| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn post_message_reaches_host() {
        let (bridge, mut rx) = MessageBridge::new();
        bridge
            .post_message(commands::ABORT, serde_json::json!({"id": "ex-1"}))
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.command, commands::ABORT);
        assert_eq!(msg.data["id"], "ex-1");
    }

    #[test]
    fn post_message_fails_without_host() {
        let (bridge, rx) = MessageBridge::new();
        drop(rx);
        let err = bridge
            .post_message(commands::CHAT_COMPLETIONS, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
    }

    #[test]
    fn dispatch_routes_by_command() {
        let (bridge, _rx) = MessageBridge::new();
        let (chunks, on_chunk) = counter();
        let (dones, on_done) = counter();
        bridge.add_command_listener(commands::CHUNK, on_chunk, ListenerOptions::default());
        bridge.add_command_listener(commands::DONE, on_done, ListenerOptions::default());

        let ran = bridge.dispatch(&BridgeMessage::new(commands::CHUNK, serde_json::Value::Null));
        assert_eq!(ran, 1);
        assert_eq!(chunks.load(Ordering::SeqCst), 1);
        assert_eq!(dones.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn once_listener_fires_once() {
        let (bridge, _rx) = MessageBridge::new();
        let (count, handler) = counter();
        bridge.add_command_listener(commands::DONE, handler, ListenerOptions { once: true });

        let done = BridgeMessage::new(commands::DONE, serde_json::Value::Null);
        bridge.dispatch(&done);
        bridge.dispatch(&done);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.listener_count(), 0);
    }

    #[test]
    fn remove_listener_is_idempotent() {
        let (bridge, _rx) = MessageBridge::new();
        let (_, handler) = counter();
        let id = bridge.add_command_listener(commands::ERROR, handler, ListenerOptions::default());

        assert!(bridge.remove_listener(id));
        assert!(!bridge.remove_listener(id));
        assert_eq!(bridge.listener_count(), 0);
    }

    #[test]
    fn handler_may_remove_listeners() {
        let (bridge, _rx) = MessageBridge::new();
        let bridge = Arc::new(bridge);
        let (count, on_chunk) = counter();
        let chunk_id =
            bridge.add_command_listener(commands::CHUNK, on_chunk, ListenerOptions::default());

        let b = bridge.clone();
        bridge.add_command_listener(
            commands::DONE,
            move |_| {
                b.remove_listener(chunk_id);
            },
            ListenerOptions { once: true },
        );

        bridge.dispatch(&BridgeMessage::new(commands::DONE, serde_json::Value::Null));
        bridge.dispatch(&BridgeMessage::new(commands::CHUNK, serde_json::Value::Null));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.listener_count(), 0);
    }
}

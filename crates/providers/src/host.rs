//! Bridge host: the backend side of the message bridge.
//!
//! Reads submissions and abort notices posted by the task loop, drives a
//! [`Provider`] stream per exchange, and dispatches each fragment, the
//! completion, or the failure back onto the bridge addressed by exchange id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chatloop_core::bridge::{commands, BridgeMessage, MessageBridge};
use chatloop_core::error::BridgeError;
use chatloop_core::provider::{ChatRequest, Provider};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::openai_compat::OpenAiCompatProvider;

/// Builds the provider that serves one exchange.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, request: &ChatRequest) -> Arc<dyn Provider>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&ChatRequest) -> Arc<dyn Provider> + Send + Sync,
{
    fn create(&self, request: &ChatRequest) -> Arc<dyn Provider> {
        self(request)
    }
}

/// One [`OpenAiCompatProvider`] per exchange, pointed at the request's
/// endpoint and credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiCompatFactory;

impl ProviderFactory for OpenAiCompatFactory {
    fn create(&self, request: &ChatRequest) -> Arc<dyn Provider> {
        Arc::new(OpenAiCompatProvider::new(
            "openai-compat",
            request.base_url.as_str(),
            request.api_key.as_str(),
        ))
    }
}

#[derive(Deserialize)]
struct AbortPayload {
    id: String,
}

type Exchanges = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Serves `llm/chat/completions` submissions and `.../abort` notices.
pub struct BridgeHost {
    bridge: Arc<MessageBridge>,
    factory: Arc<dyn ProviderFactory>,
    exchanges: Exchanges,
}

impl BridgeHost {
    pub fn new(bridge: Arc<MessageBridge>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            bridge,
            factory,
            exchanges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the host on its own task.
    pub fn spawn(self, outbound: mpsc::UnboundedReceiver<BridgeMessage>) -> JoinHandle<()> {
        tokio::spawn(self.run(outbound))
    }

    /// Serve outbound messages until every bridge handle is dropped.
    pub async fn run(self, mut outbound: mpsc::UnboundedReceiver<BridgeMessage>) {
        info!("Bridge host started");
        while let Some(message) = outbound.recv().await {
            self.handle(message);
        }

        for (id, handle) in lock(&self.exchanges).drain() {
            debug!(exchange_id = %id, "Cancelling exchange on shutdown");
            handle.abort();
        }
        info!("Bridge host stopped");
    }

    /// Exchanges whose stream task is still running.
    pub fn in_flight(&self) -> usize {
        lock(&self.exchanges).len()
    }

    fn handle(&self, message: BridgeMessage) {
        match message.command.as_str() {
            commands::CHAT_COMPLETIONS => self.submit(message.data),
            commands::ABORT => self.abort(message.data),
            other => warn!(command = other, "Ignoring unknown bridge command"),
        }
    }

    fn submit(&self, data: serde_json::Value) {
        let request: ChatRequest = match serde_json::from_value(data.clone()) {
            Ok(request) => request,
            Err(e) => {
                let err = BridgeError::MalformedPayload {
                    command: commands::CHAT_COMPLETIONS.into(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Rejecting submission");
                if let Some(id) = data.get("id").and_then(|v| v.as_str()) {
                    dispatch_error(&self.bridge, id, &err.to_string());
                }
                return;
            }
        };

        let provider = self.factory.create(&request);
        let id = request.id.clone();
        debug!(exchange_id = %id, provider = provider.name(), model = %request.request.model, "Starting exchange");

        let bridge = self.bridge.clone();
        let exchanges = self.exchanges.clone();
        let task_id = id.clone();

        // The map stays locked until the handle is stored, so the task's own
        // removal always happens after the insert.
        let mut map = lock(&self.exchanges);
        let handle = tokio::spawn(async move {
            stream_exchange(&bridge, provider, request).await;
            lock(&exchanges).remove(&task_id);
        });
        map.insert(id, handle);
    }

    fn abort(&self, data: serde_json::Value) {
        let payload: AbortPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed abort payload");
                return;
            }
        };

        let handle = lock(&self.exchanges).remove(&payload.id);
        match handle {
            Some(handle) => {
                handle.abort();
                info!(exchange_id = %payload.id, "Exchange aborted");
                dispatch_done(&self.bridge, &payload.id);
            }
            None => debug!(exchange_id = %payload.id, "Abort for finished exchange"),
        }
    }
}

async fn stream_exchange(bridge: &MessageBridge, provider: Arc<dyn Provider>, request: ChatRequest) {
    let id = request.id;
    let mut chunks = match provider.stream(request.request).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(exchange_id = %id, error = %e, "Provider refused stream");
            dispatch_error(bridge, &id, &e.to_string());
            return;
        }
    };

    let mut count = 0usize;
    while let Some(item) = chunks.recv().await {
        match item {
            Ok(chunk) => {
                count += 1;
                bridge.dispatch(&BridgeMessage::new(
                    commands::CHUNK,
                    serde_json::json!({ "id": id, "chunk": chunk }),
                ));
            }
            Err(e) => {
                warn!(exchange_id = %id, error = %e, "Stream failed");
                dispatch_error(bridge, &id, &e.to_string());
                return;
            }
        }
    }

    debug!(exchange_id = %id, chunks = count, "Stream finished");
    dispatch_done(bridge, &id);
}

fn dispatch_done(bridge: &MessageBridge, id: &str) {
    bridge.dispatch(&BridgeMessage::new(
        commands::DONE,
        serde_json::json!({ "id": id }),
    ));
}

fn dispatch_error(bridge: &MessageBridge, id: &str, message: &str) {
    bridge.dispatch(&BridgeMessage::new(
        commands::ERROR,
        serde_json::json!({ "id": id, "message": message }),
    ));
}

fn lock(exchanges: &Exchanges) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
    exchanges.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatloop_core::bridge::ListenerOptions;
    use chatloop_core::error::ProviderError;
    use chatloop_core::provider::{
        ChunkReceiver, ProviderRequest, ProviderResponse, StreamChunk,
    };

    /// Streams a fixed list of items; `hang` keeps the stream open forever.
    struct ScriptedProvider {
        items: Vec<Result<StreamChunk, ProviderError>>,
        hang: bool,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("streaming only".into()))
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
            let (tx, rx) = mpsc::channel(16);
            let items = self.items.clone();
            let hang = self.hang;
            tokio::spawn(async move {
                for item in items {
                    let _ = tx.send(item).await;
                }
                if hang {
                    std::future::pending::<()>().await;
                }
            });
            Ok(rx)
        }
    }

    fn submission(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "base_url": "http://localhost:1",
            "api_key": "sk-test",
            "model": "m",
            "messages": [],
            "stream": true,
        })
    }

    /// Collect every (command, payload) the host dispatches.
    fn record(bridge: &MessageBridge) -> mpsc::UnboundedReceiver<(String, serde_json::Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        for command in [commands::CHUNK, commands::DONE, commands::ERROR] {
            let tx = tx.clone();
            bridge.add_command_listener(
                command,
                move |data| {
                    let _ = tx.send((command.to_string(), data.clone()));
                },
                ListenerOptions::default(),
            );
        }
        rx
    }

    fn host_with(items: Vec<Result<StreamChunk, ProviderError>>, hang: bool) -> (Arc<MessageBridge>, JoinHandle<()>) {
        let (bridge, outbound) = MessageBridge::new();
        let bridge = Arc::new(bridge);
        let factory = move |_: &ChatRequest| -> Arc<dyn Provider> {
            Arc::new(ScriptedProvider {
                items: items.clone(),
                hang,
            })
        };
        let handle = BridgeHost::new(bridge.clone(), Arc::new(factory)).spawn(outbound);
        (bridge, handle)
    }

    #[tokio::test]
    async fn streams_chunks_then_done() {
        let (bridge, _host) = host_with(
            vec![Ok(StreamChunk::text("a")), Ok(StreamChunk::text("b"))],
            false,
        );
        let mut events = record(&bridge);
        bridge.post_message(commands::CHAT_COMPLETIONS, submission("ex-1")).unwrap();

        let (cmd, data) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::CHUNK);
        assert_eq!(data["id"], "ex-1");
        assert_eq!(data["chunk"]["content"], "a");
        let (cmd, _) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::CHUNK);
        let (cmd, data) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::DONE);
        assert_eq!(data["id"], "ex-1");
    }

    #[tokio::test]
    async fn stream_failure_dispatches_error() {
        let (bridge, _host) = host_with(
            vec![
                Ok(StreamChunk::text("a")),
                Err(ProviderError::StreamInterrupted("reset by peer".into())),
            ],
            false,
        );
        let mut events = record(&bridge);
        bridge.post_message(commands::CHAT_COMPLETIONS, submission("ex-2")).unwrap();

        let (cmd, _) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::CHUNK);
        let (cmd, data) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::ERROR);
        assert!(data["message"].as_str().unwrap().contains("reset by peer"));
    }

    #[tokio::test]
    async fn malformed_submission_reports_error_to_its_id() {
        let (bridge, _host) = host_with(vec![], false);
        let mut events = record(&bridge);
        bridge
            .post_message(commands::CHAT_COMPLETIONS, serde_json::json!({"id": "ex-3"}))
            .unwrap();

        let (cmd, data) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::ERROR);
        assert_eq!(data["id"], "ex-3");
    }

    #[tokio::test]
    async fn abort_cancels_stream_and_reports_done() {
        let (bridge, outbound) = MessageBridge::new();
        let bridge = Arc::new(bridge);
        let factory = |_: &ChatRequest| -> Arc<dyn Provider> {
            Arc::new(ScriptedProvider {
                items: vec![Ok(StreamChunk::text("partial"))],
                hang: true,
            })
        };
        let host = BridgeHost::new(bridge.clone(), Arc::new(factory));
        let exchanges = host.exchanges.clone();
        let _task = host.spawn(outbound);

        let mut events = record(&bridge);
        bridge.post_message(commands::CHAT_COMPLETIONS, submission("ex-4")).unwrap();
        let (cmd, _) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::CHUNK);
        assert_eq!(lock(&exchanges).len(), 1);

        bridge
            .post_message(commands::ABORT, serde_json::json!({"id": "ex-4"}))
            .unwrap();
        let (cmd, data) = events.recv().await.unwrap();
        assert_eq!(cmd, commands::DONE);
        assert_eq!(data["id"], "ex-4");
        assert!(lock(&exchanges).is_empty());
    }

    #[test]
    fn openai_factory_targets_request_endpoint() {
        let request: ChatRequest = serde_json::from_value(submission("ex-5")).unwrap();
        let provider = OpenAiCompatFactory.create(&request);
        assert_eq!(provider.name(), "openai-compat");
    }
}

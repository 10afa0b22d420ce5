//! Shared test helpers: a scripted backend on the far side of the bridge.

use chatloop_core::bridge::{commands, BridgeMessage, MessageBridge};
use chatloop_core::provider::{ChatRequest, StreamChunk, ToolCallDelta, Usage};
use chatloop_core::settings::{ChatSettings, ModelSettings, StaticSettings};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the backend answers one submission.
#[derive(Debug, Clone)]
pub enum ScriptedExchange {
    /// Emit the chunks, then `done`.
    Complete(Vec<StreamChunk>),
    /// Emit the chunks, then `error` with the message.
    Fail(Vec<StreamChunk>, String),
    /// Emit the chunks, then wait for an abort and answer it with `done`.
    Stall(Vec<StreamChunk>),
}

#[derive(Default)]
struct Recorded {
    requests: Vec<ChatRequest>,
    aborts: Vec<String>,
}

/// Answers bridge submissions from a script, in order.
///
/// When the script runs out, the last entry repeats if `repeat` was set,
/// otherwise the exchange completes with no output.
pub struct ScriptedBackend {
    recorded: Arc<Mutex<Recorded>>,
    _task: JoinHandle<()>,
}

impl ScriptedBackend {
    pub fn spawn(
        bridge: Arc<MessageBridge>,
        outbound: mpsc::UnboundedReceiver<BridgeMessage>,
        script: Vec<ScriptedExchange>,
    ) -> Self {
        Self::start(bridge, outbound, script, false)
    }

    pub fn repeating(
        bridge: Arc<MessageBridge>,
        outbound: mpsc::UnboundedReceiver<BridgeMessage>,
        exchange: ScriptedExchange,
    ) -> Self {
        Self::start(bridge, outbound, vec![exchange], true)
    }

    fn start(
        bridge: Arc<MessageBridge>,
        mut outbound: mpsc::UnboundedReceiver<BridgeMessage>,
        script: Vec<ScriptedExchange>,
        repeat: bool,
    ) -> Self {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let log = recorded.clone();

        let task = tokio::spawn(async move {
            let mut stalled: Option<String> = None;
            while let Some(msg) = outbound.recv().await {
                match msg.command.as_str() {
                    commands::CHAT_COMPLETIONS => {
                        let request: ChatRequest = serde_json::from_value(msg.data).unwrap();
                        let id = request.id.clone();
                        let position = {
                            let mut log = log.lock().unwrap();
                            log.requests.push(request);
                            log.requests.len() - 1
                        };
                        let exchange = script
                            .get(position)
                            .or_else(|| if repeat { script.last() } else { None })
                            .cloned()
                            .unwrap_or(ScriptedExchange::Complete(vec![]));

                        match exchange {
                            ScriptedExchange::Complete(chunks) => {
                                emit(&bridge, &id, &chunks);
                                end(&bridge, commands::DONE, &id, None);
                            }
                            ScriptedExchange::Fail(chunks, message) => {
                                emit(&bridge, &id, &chunks);
                                end(&bridge, commands::ERROR, &id, Some(&message));
                            }
                            ScriptedExchange::Stall(chunks) => {
                                emit(&bridge, &id, &chunks);
                                stalled = Some(id);
                            }
                        }
                    }
                    commands::ABORT => {
                        let id = msg.data["id"].as_str().unwrap_or_default().to_string();
                        log.lock().unwrap().aborts.push(id.clone());
                        if stalled.as_deref() == Some(id.as_str()) {
                            stalled = None;
                            end(&bridge, commands::DONE, &id, None);
                        }
                    }
                    other => panic!("unexpected command {other}"),
                }
            }
        });

        Self {
            recorded,
            _task: task,
        }
    }

    /// Number of submissions answered so far.
    pub fn exchanges(&self) -> usize {
        self.recorded.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.recorded.lock().unwrap().requests.clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.recorded.lock().unwrap().aborts.clone()
    }
}

fn emit(bridge: &MessageBridge, id: &str, chunks: &[StreamChunk]) {
    for chunk in chunks {
        bridge.dispatch(&BridgeMessage::new(
            commands::CHUNK,
            serde_json::json!({ "id": id, "chunk": chunk }),
        ));
    }
}

fn end(bridge: &MessageBridge, command: &str, id: &str, message: Option<&str>) {
    let data = match message {
        Some(message) => serde_json::json!({ "id": id, "message": message }),
        None => serde_json::json!({ "id": id }),
    };
    bridge.dispatch(&BridgeMessage::new(command, data));
}

/// A complete tool-call fragment at `index`.
pub fn tool_call_chunk(index: u32, id: &str, name: &str, arguments: &str) -> StreamChunk {
    StreamChunk::tool_call(ToolCallDelta {
        index,
        id: Some(id.into()),
        name: Some(name.into()),
        arguments: Some(arguments.into()),
    })
}

pub fn usage_chunk(total: u32) -> StreamChunk {
    StreamChunk::usage(Usage {
        prompt_tokens: total / 2,
        completion_tokens: total - total / 2,
        total_tokens: total,
    })
}

/// Settings with a usable key on model `test`.
pub fn settings() -> StaticSettings {
    StaticSettings::new(
        ModelSettings {
            id: "test".into(),
            base_url: "http://localhost:1".into(),
            api_key: "sk-test".into(),
            model: "test-model".into(),
        },
        ChatSettings::default(),
    )
}

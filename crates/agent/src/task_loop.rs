//! The conversation task loop.
//!
//! Each epoch builds a request from the transcript, streams one exchange
//! through the bridge, then either dispatches the requested tool call(s) and
//! loops, appends the final answer and stops, or stops with nothing to show.
//!
//! The loop never fails: transport and configuration problems reach the
//! error hook, tool and parse problems are written into the transcript.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chatloop_core::bridge::MessageBridge;
use chatloop_core::error::{ErrorReport, TaskLoopError};
use chatloop_core::event::{DomainEvent, EventBus};
use chatloop_core::message::{Conversation, Message, MessageState, Role, ToolInvocation};
use chatloop_core::provider::{ChatRequest, ProviderRequest, StreamChunk};
use chatloop_core::settings::{SettingsProvider, ToolCallPolicy};
use chatloop_core::tool::ToolExecutor;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::TurnState;
use crate::dispatcher::{DispatchOutcome, ToolDispatcher};
use crate::transport::{ConversationTransport, ExchangeObserver};

/// Loop limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLoopOptions {
    /// Maximum number of exchanges per `start()`
    pub max_epochs: usize,

    /// Consecutive-or-not tool argument parse failures tolerated per `start()`
    pub max_json_parse_retry: usize,
}

impl Default for TaskLoopOptions {
    fn default() -> Self {
        Self {
            max_epochs: 20,
            max_json_parse_retry: 3,
        }
    }
}

/// Why `start()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    FinalAnswer,
    NoOutput,
    TransportError,
    MissingCredential,
    ParseRetryExhausted,
    EpochBudgetExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    /// Exchanges sent to the backend
    pub exchanges: usize,
    pub stop_reason: StopReason,
}

type ErrorHook = Box<dyn Fn(&ErrorReport) + Send + Sync>;
type ChunkHook = Box<dyn Fn(&StreamChunk, &TurnState) + Send + Sync>;
type DoneHook = Box<dyn Fn() + Send + Sync>;
type EpochHook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    error: Vec<ErrorHook>,
    chunk: Vec<ChunkHook>,
    done: Vec<DoneHook>,
    epoch: Vec<EpochHook>,
}

/// The result of running the tool calls of one turn.
enum ToolRound {
    /// Nothing ran; the turn must be rolled back.
    ParseFailed(TaskLoopError),
    Completed(Vec<(ToolInvocation, DispatchOutcome)>),
}

/// Drives a conversation through repeated model exchanges and tool calls.
///
/// Hooks are registered before the loop is shared; `start()` and `abort()`
/// both take `&self` so an `Arc<TaskLoop>` can be aborted from another task
/// while it runs.
pub struct TaskLoop {
    transport: ConversationTransport,
    dispatcher: ToolDispatcher,
    settings: Arc<dyn SettingsProvider>,
    max_epochs: AtomicUsize,
    max_json_parse_retry: usize,
    tool_call_policy: ToolCallPolicy,
    event_bus: Option<Arc<EventBus>>,
    hooks: Hooks,
    turn: Mutex<TurnState>,
    current_exchange: Mutex<Option<String>>,
}

impl TaskLoop {
    pub fn new(
        bridge: Arc<MessageBridge>,
        executor: Arc<dyn ToolExecutor>,
        settings: Arc<dyn SettingsProvider>,
        options: TaskLoopOptions,
    ) -> Self {
        Self {
            transport: ConversationTransport::new(bridge),
            dispatcher: ToolDispatcher::new(executor),
            settings,
            max_epochs: AtomicUsize::new(options.max_epochs),
            max_json_parse_retry: options.max_json_parse_retry,
            tool_call_policy: ToolCallPolicy::default(),
            event_bus: None,
            hooks: Hooks::default(),
            turn: Mutex::new(TurnState::new()),
            current_exchange: Mutex::new(None),
        }
    }

    pub fn with_tool_call_policy(mut self, policy: ToolCallPolicy) -> Self {
        self.tool_call_policy = policy;
        self
    }

    /// Publish domain events for this loop on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Called with every transport or configuration failure, and with tool
    /// executor failures.
    pub fn register_on_error(&mut self, hook: impl Fn(&ErrorReport) + Send + Sync + 'static) {
        self.hooks.error.push(Box::new(hook));
    }

    /// Called after each fragment is folded in, with a snapshot of the turn.
    pub fn register_on_chunk(
        &mut self,
        hook: impl Fn(&StreamChunk, &TurnState) + Send + Sync + 'static,
    ) {
        self.hooks.chunk.push(Box::new(hook));
    }

    /// Called when an exchange completes, and when the loop ends for lack of
    /// a credential.
    pub fn register_on_done(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.done.push(Box::new(hook));
    }

    /// Called with the epoch index before each exchange is built.
    pub fn register_on_epoch(&mut self, hook: impl Fn(usize) + Send + Sync + 'static) {
        self.hooks.epoch.push(Box::new(hook));
    }

    pub fn set_max_epochs(&self, max_epochs: usize) {
        self.max_epochs.store(max_epochs, Ordering::Relaxed);
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs.load(Ordering::Relaxed)
    }

    pub fn max_json_parse_retry(&self) -> usize {
        self.max_json_parse_retry
    }

    pub fn tool_call_policy(&self) -> ToolCallPolicy {
        self.tool_call_policy
    }

    /// A copy of the turn accumulated so far.
    pub fn turn_snapshot(&self) -> TurnState {
        self.turn().clone()
    }

    /// Cancel the in-flight exchange and drop its partial output.
    ///
    /// The pending exchange still ends through the backend's completion or
    /// error event.
    pub fn abort(&self) {
        let current = self.exchange_slot().clone();
        match current {
            Some(id) => {
                info!(exchange_id = %id, "Aborting exchange");
                self.transport.abort(&id);
            }
            None => debug!("Abort requested with no exchange in flight"),
        }
        self.turn().reset();
    }

    /// Append `user_message` and run epochs until the loop stops.
    pub async fn start(
        &self,
        conversation: &mut Conversation,
        user_message: impl Into<String>,
    ) -> LoopSummary {
        conversation.push(Message::user(user_message).with_server(self.server_name()));

        let max_epochs = self.max_epochs();
        info!(
            conversation_id = %conversation.id,
            messages = conversation.len(),
            max_epochs,
            policy = ?self.tool_call_policy,
            "Starting task loop"
        );

        let mut exchanges = 0;
        let mut parse_failures = 0;
        let mut stop_reason = StopReason::EpochBudgetExhausted;

        for epoch in 0..max_epochs {
            for hook in &self.hooks.epoch {
                hook(epoch);
            }
            self.turn().reset();

            let request = match self.build_request(conversation) {
                Ok(request) => request,
                Err(err) => {
                    if conversation.pop_last(Role::User).is_some() {
                        warn!("Rolled back user message: no usable credential");
                    }
                    self.report(ErrorReport::from(&err));
                    self.notify_done();
                    stop_reason = StopReason::MissingCredential;
                    break;
                }
            };

            *self.exchange_slot() = Some(request.id.clone());
            debug!(epoch, exchange_id = %request.id, "Sending exchange");
            self.publish(DomainEvent::ExchangeStarted {
                conversation_id: conversation.id.to_string(),
                exchange_id: request.id.clone(),
                epoch,
                timestamp: Utc::now(),
            });

            let outcome = self.transport.send(&request, self).await;
            exchanges += 1;
            *self.exchange_slot() = None;

            let turn = self.turn_snapshot();
            if let Some(usage) = &turn.usage {
                self.publish(DomainEvent::ResponseGenerated {
                    conversation_id: conversation.id.to_string(),
                    model: request.request.model.clone(),
                    tokens_used: usage.total_tokens,
                    timestamp: Utc::now(),
                });
            }

            let server = self.server_name();
            let mut finished = None;

            if turn.has_tool_calls() {
                conversation.push(
                    Message::assistant(turn.content.clone())
                        .with_tool_calls(turn.tool_calls.clone())
                        .with_server(server.clone()),
                );
                debug!(count = turn.tool_calls.len(), "Model requested tool calls");

                match self.run_tools(&turn.tool_calls).await {
                    ToolRound::ParseFailed(err) => {
                        conversation.pop_last(Role::Assistant);
                        parse_failures += 1;
                        warn!(
                            attempt = parse_failures,
                            limit = self.max_json_parse_retry,
                            error = %err,
                            "Rolled back assistant turn with unparseable tool arguments"
                        );

                        if parse_failures >= self.max_json_parse_retry {
                            conversation.push(
                                Message::assistant(format!(
                                    "Failed to parse tool call arguments as JSON; giving up after {} attempts",
                                    self.max_json_parse_retry
                                ))
                                .with_state(MessageState::ParseJsonError)
                                .with_server(server.clone()),
                            );
                            finished = Some(StopReason::ParseRetryExhausted);
                        }
                    }
                    ToolRound::Completed(results) => {
                        for (invocation, outcome) in results {
                            conversation.push(
                                Message::tool_result(invocation.call_id(), outcome.content)
                                    .with_state(outcome.state)
                                    .with_server(server.clone())
                                    .with_usage(turn.usage.clone()),
                            );
                        }
                    }
                }
            } else if !turn.content.is_empty() {
                conversation.push(
                    Message::assistant(turn.content.clone())
                        .with_server(server.clone())
                        .with_usage(turn.usage.clone()),
                );
                finished = Some(StopReason::FinalAnswer);
            } else {
                debug!(epoch, "Exchange produced no output");
                finished = Some(StopReason::NoOutput);
            }

            if outcome.stop() {
                stop_reason = StopReason::TransportError;
                break;
            }
            if let Some(reason) = finished {
                stop_reason = reason;
                break;
            }
        }

        info!(
            conversation_id = %conversation.id,
            exchanges,
            stop_reason = ?stop_reason,
            "Task loop finished"
        );
        LoopSummary {
            exchanges,
            stop_reason,
        }
    }

    /// Build the next exchange from the transcript and current settings.
    fn build_request(&self, conversation: &Conversation) -> Result<ChatRequest, TaskLoopError> {
        let model = self.settings.current_model();
        if !model.has_credential() {
            return Err(TaskLoopError::Configuration(format!(
                "model '{}' has no API key",
                model.server_name()
            )));
        }
        let chat = self.settings.chat_settings();

        let mut messages = Vec::new();
        if let Some(prompt) = chat.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(Message::system(prompt));
        }
        messages.extend(conversation.recent(chat.context_length).iter().cloned());

        let tools = self
            .dispatcher
            .executor()
            .definitions()
            .into_iter()
            .filter(|def| chat.tool_enabled(&def.name))
            .collect();

        Ok(ChatRequest {
            id: Uuid::new_v4().to_string(),
            base_url: model.base_url,
            api_key: model.api_key,
            request: ProviderRequest {
                model: model.model,
                messages,
                temperature: chat.temperature,
                max_tokens: None,
                tools,
                stream: true,
            },
        })
    }

    /// Parse every selected invocation, then run them in index order.
    async fn run_tools(&self, calls: &[ToolInvocation]) -> ToolRound {
        let selected = match self.tool_call_policy {
            ToolCallPolicy::First => &calls[..calls.len().min(1)],
            ToolCallPolicy::Sequential => calls,
        };

        let mut parsed = Vec::with_capacity(selected.len());
        for invocation in selected {
            match ToolDispatcher::parse_arguments(invocation) {
                Ok(arguments) => parsed.push((invocation, arguments)),
                Err(err) => return ToolRound::ParseFailed(err),
            }
        }

        let mut results = Vec::with_capacity(parsed.len());
        for (invocation, arguments) in parsed {
            let started = Instant::now();
            let outcome = self
                .dispatcher
                .call(invocation, arguments, |report| self.report(report))
                .await;
            self.publish(DomainEvent::ToolExecuted {
                tool_name: invocation.name.clone(),
                success: outcome.is_success(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });
            results.push((invocation.clone(), outcome));
        }
        ToolRound::Completed(results)
    }

    fn report(&self, report: ErrorReport) {
        self.publish(DomainEvent::ErrorOccurred {
            state: report.state,
            error_message: report.message.clone(),
            timestamp: Utc::now(),
        });
        for hook in &self.hooks.error {
            hook(&report);
        }
    }

    fn notify_done(&self) {
        for hook in &self.hooks.done {
            hook();
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn server_name(&self) -> String {
        self.settings.current_model().server_name().to_string()
    }

    fn turn(&self) -> MutexGuard<'_, TurnState> {
        self.turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn exchange_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.current_exchange
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ExchangeObserver for TaskLoop {
    fn on_chunk(&self, chunk: &StreamChunk) {
        if self.hooks.chunk.is_empty() {
            self.turn().apply(chunk);
            return;
        }
        let snapshot = {
            let mut turn = self.turn();
            turn.apply(chunk);
            turn.clone()
        };
        for hook in &self.hooks.chunk {
            hook(chunk, &snapshot);
        }
    }

    fn on_done(&self) {
        self.notify_done();
    }

    fn on_error(&self, report: ErrorReport) {
        self.report(report);
    }
}

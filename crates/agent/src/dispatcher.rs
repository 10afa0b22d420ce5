//! Tool dispatch: parse an assembled invocation, run it, classify the result.

use std::sync::Arc;

use chatloop_core::error::{ErrorReport, TaskLoopError};
use chatloop_core::message::{ContentBlock, MessageState, ToolInvocation};
use chatloop_core::tool::{ToolArguments, ToolExecutor, ToolOutput};
use tracing::{debug, warn};

/// The classified result of one tool invocation.
///
/// `state` is `Success`, `ToolCall` (a tool-level failure the model should
/// see), or `ParseJsonError` (nothing was executed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub content: Vec<ContentBlock>,
    pub state: MessageState,
}

impl DispatchOutcome {
    fn failed(state: MessageState, detail: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::error(detail)],
            state,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == MessageState::Success
    }
}

/// Stateless bridge between assembled invocations and a [`ToolExecutor`].
#[derive(Clone)]
pub struct ToolDispatcher {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolDispatcher {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    /// Parse the raw argument text as a JSON object.
    pub fn parse_arguments(invocation: &ToolInvocation) -> Result<ToolArguments, TaskLoopError> {
        match serde_json::from_str::<serde_json::Value>(&invocation.arguments) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => Err(TaskLoopError::ParseJson(format!(
                "expected an object for '{}', got {}",
                invocation.name,
                json_kind(&other)
            ))),
            Err(e) => Err(TaskLoopError::ParseJson(e.to_string())),
        }
    }

    /// Parse and run one invocation.
    ///
    /// Executor failures are passed to `on_error` and still come back as a
    /// `ToolCall` outcome; they never abort the caller.
    pub async fn dispatch<F>(&self, invocation: &ToolInvocation, on_error: F) -> DispatchOutcome
    where
        F: Fn(ErrorReport),
    {
        match Self::parse_arguments(invocation) {
            Ok(arguments) => self.call(invocation, arguments, on_error).await,
            Err(err) => {
                warn!(tool = %invocation.name, error = %err, "Tool arguments failed to parse");
                DispatchOutcome::failed(err.state(), err.to_string())
            }
        }
    }

    /// Run an invocation whose arguments are already parsed.
    pub async fn call<F>(
        &self,
        invocation: &ToolInvocation,
        arguments: ToolArguments,
        on_error: F,
    ) -> DispatchOutcome
    where
        F: Fn(ErrorReport),
    {
        debug!(tool = %invocation.name, call_id = %invocation.call_id(), "Dispatching tool call");

        match self.executor.call_tool(&invocation.name, arguments).await {
            Ok(ToolOutput::Diagnostic(text)) => {
                DispatchOutcome::failed(MessageState::ToolCall, text)
            }
            Ok(ToolOutput::Result(result)) if result.is_error => DispatchOutcome {
                content: result.content,
                state: MessageState::ToolCall,
            },
            Ok(ToolOutput::Result(result)) => DispatchOutcome {
                content: result.content,
                state: MessageState::Success,
            },
            Err(e) => {
                warn!(tool = %invocation.name, error = %e, "Tool execution failed");
                let err = TaskLoopError::ToolCall(e.to_string());
                on_error(ErrorReport::from(&err));
                DispatchOutcome::failed(MessageState::ToolCall, e.to_string())
            }
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatloop_core::error::ToolError;
    use chatloop_core::provider::ToolDefinition;
    use chatloop_core::tool::ToolResult;
    use std::sync::Mutex;

    /// Executor whose behaviour is chosen by tool name.
    #[derive(Default)]
    struct StubExecutor {
        calls: Mutex<Vec<(String, ToolArguments)>>,
    }

    #[async_trait]
    impl ToolExecutor for StubExecutor {
        async fn call_tool(&self, name: &str, arguments: ToolArguments) -> Result<ToolOutput, ToolError> {
            self.calls.lock().unwrap().push((name.to_string(), arguments));
            match name {
                "ok" => Ok(ToolResult::ok(vec![ContentBlock::text("done")]).into()),
                "flagged" => Ok(ToolResult::error(vec![ContentBlock::text("quota exceeded")]).into()),
                "diagnostic" => Ok(ToolOutput::Diagnostic("server offline".into())),
                _ => Err(ToolError::NotFound(name.to_string())),
            }
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    fn invocation(name: &str, arguments: &str) -> ToolInvocation {
        ToolInvocation {
            index: 0,
            id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    fn setup() -> (Arc<StubExecutor>, ToolDispatcher) {
        let executor = Arc::new(StubExecutor::default());
        let dispatcher = ToolDispatcher::new(executor.clone());
        (executor, dispatcher)
    }

    #[tokio::test]
    async fn successful_result_passes_content_through() {
        let (executor, dispatcher) = setup();
        let outcome = dispatcher
            .dispatch(&invocation("ok", r#"{"path":"/tmp"}"#), |_| panic!("no error expected"))
            .await;

        assert_eq!(outcome.state, MessageState::Success);
        assert_eq!(outcome.content, vec![ContentBlock::text("done")]);
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[0].1["path"], "/tmp");
    }

    #[tokio::test]
    async fn malformed_arguments_skip_the_executor() {
        let (executor, dispatcher) = setup();
        let outcome = dispatcher.dispatch(&invocation("ok", "{bad"), |_| {}).await;

        assert_eq!(outcome.state, MessageState::ParseJsonError);
        assert!(outcome.content[0].is_error());
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_object_arguments_are_parse_errors() {
        let (_, dispatcher) = setup();
        for raw in ["[1,2]", "42", "\"text\"", ""] {
            let outcome = dispatcher.dispatch(&invocation("ok", raw), |_| {}).await;
            assert_eq!(outcome.state, MessageState::ParseJsonError, "payload {raw:?}");
        }
    }

    #[tokio::test]
    async fn flagged_result_is_a_tool_call_failure() {
        let (_, dispatcher) = setup();
        let outcome = dispatcher.dispatch(&invocation("flagged", "{}"), |_| {}).await;

        assert_eq!(outcome.state, MessageState::ToolCall);
        assert_eq!(outcome.content, vec![ContentBlock::text("quota exceeded")]);
    }

    #[tokio::test]
    async fn diagnostic_string_becomes_error_block() {
        let (_, dispatcher) = setup();
        let outcome = dispatcher.dispatch(&invocation("diagnostic", "{}"), |_| {}).await;

        assert_eq!(outcome.state, MessageState::ToolCall);
        assert_eq!(outcome.content, vec![ContentBlock::error("server offline")]);
    }

    #[tokio::test]
    async fn executor_failure_is_reported_and_absorbed() {
        let (_, dispatcher) = setup();
        let reports = Mutex::new(Vec::new());
        let outcome = dispatcher
            .dispatch(&invocation("missing", "{}"), |r| reports.lock().unwrap().push(r))
            .await;

        assert_eq!(outcome.state, MessageState::ToolCall);
        assert!(outcome.content[0].is_error());

        let reports = reports.into_inner().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, MessageState::ToolCall);
        assert!(reports[0].message.contains("missing"));
    }
}

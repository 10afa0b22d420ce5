//! Tool traits: the abstraction over agent capabilities.
//!
//! The task loop only sees a [`ToolExecutor`]: something that can run a named
//! tool with a JSON object of arguments. [`ToolRegistry`] is the stock
//! executor, backed by individually registered [`Tool`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::error::ToolError;
use crate::message::ContentBlock;
use crate::provider::ToolDefinition;

/// JSON object arguments handed to a tool.
pub type ToolArguments = serde_json::Map<String, serde_json::Value>;

/// A structured tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool flagged its own output as an error
    #[serde(default)]
    pub is_error: bool,

    /// The output content
    pub content: Vec<ContentBlock>,
}

impl ToolResult {
    pub fn ok(content: Vec<ContentBlock>) -> Self {
        Self {
            is_error: false,
            content,
        }
    }

    pub fn error(content: Vec<ContentBlock>) -> Self {
        Self {
            is_error: true,
            content,
        }
    }
}

/// What an executor hands back: a structured result, or a bare diagnostic
/// string that the loop reports to the model as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Result(ToolResult),
    Diagnostic(String),
}

impl From<ToolResult> for ToolOutput {
    fn from(result: ToolResult) -> Self {
        Self::Result(result)
    }
}

/// Runs tools on behalf of the task loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Invoke the tool called `name`.
    async fn call_tool(&self, name: &str, arguments: ToolArguments) -> std::result::Result<ToolOutput, ToolError>;

    /// Definitions of every tool this executor can run.
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// A single tool that can be registered in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: ToolArguments) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn call_tool(&self, name: &str, arguments: ToolArguments) -> std::result::Result<ToolOutput, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments).await
    }

    /// Definitions sorted by name, so requests are stable across runs.
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "Echoes back the input" }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, arguments: ToolArguments) -> std::result::Result<ToolOutput, ToolError> {
            match arguments.get("text").and_then(|v| v.as_str()) {
                Some(text) => Ok(ToolResult::ok(vec![ContentBlock::text(text)]).into()),
                None => Ok(ToolOutput::Diagnostic("missing 'text'".into())),
            }
        }
    }

    fn args(value: serde_json::Value) -> ToolArguments {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn registry_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }

    #[tokio::test]
    async fn registry_execute_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        let output = registry
            .call_tool("echo", args(serde_json::json!({"text": "hello world"})))
            .await
            .unwrap();
        assert_eq!(
            output,
            ToolOutput::Result(ToolResult::ok(vec![ContentBlock::text("hello world")]))
        );
    }

    #[tokio::test]
    async fn registry_passes_diagnostics_through() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        let output = registry.call_tool("echo", ToolArguments::new()).await.unwrap();
        assert!(matches!(output, ToolOutput::Diagnostic(_)));
    }

    #[tokio::test]
    async fn registry_execute_missing_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .call_tool("nonexistent", ToolArguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}

//! Error types for the chatloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

use crate::message::MessageState;

/// The top-level error type for all chatloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Bridge errors ---
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    // --- Task loop errors ---
    #[error("Task loop error: {0}")]
    TaskLoop(#[from] TaskLoopError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// Failures of the command message bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("Bridge closed: no host is reading outbound messages")]
    Closed,

    #[error("Malformed {command} payload: {reason}")]
    MalformedPayload { command: String, reason: String },
}

/// The task loop's failure taxonomy.
///
/// `ParseJson` and `ToolCall` are absorbed into the transcript; `Transport`
/// and `Configuration` reach the caller's error hook and end the loop.
#[derive(Debug, Clone, Error)]
pub enum TaskLoopError {
    #[error("Tool arguments are not a valid JSON object: {0}")]
    ParseJson(String),

    #[error("Tool call failed: {0}")]
    ToolCall(String),

    #[error("Streaming exchange failed: {0}")]
    Transport(String),

    #[error("No usable credential: {0}")]
    Configuration(String),
}

impl TaskLoopError {
    /// The message state recorded for this failure.
    pub fn state(&self) -> MessageState {
        match self {
            Self::ParseJson(_) => MessageState::ParseJsonError,
            Self::ToolCall(_) => MessageState::ToolCall,
            Self::Transport(_) => MessageState::ReceiveChunkError,
            Self::Configuration(_) => MessageState::MissingCredential,
        }
    }
}

/// What the task loop hands to the caller's error hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub state: MessageState,
    pub message: String,
}

impl ErrorReport {
    pub fn new(state: MessageState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

impl From<&TaskLoopError> for ErrorReport {
    fn from(err: &TaskLoopError) -> Self {
        Self::new(err.state(), err.to_string())
    }
}

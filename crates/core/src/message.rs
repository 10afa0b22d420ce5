//! Message and Conversation domain types.
//!
//! These are the core value objects the task loop reads and appends:
//! user input, assistant answers, tool requests, and tool results, each
//! tagged with enough metadata to replay or audit a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// Lifecycle state recorded on every transcript entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    #[default]
    Success,
    /// A tool ran (or failed to run) and reported an error back to the model.
    ToolCall,
    /// Tool arguments could not be parsed as a JSON object.
    ParseJsonError,
    /// The streaming exchange failed.
    ReceiveChunkError,
    /// No usable credential was configured.
    MissingCredential,
}

/// One block of structured content, as produced by tool results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Error { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text { text } | Self::Error { text } => text,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Message body: plain text, or content blocks for tool results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to a single string; blocks are joined with newlines.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(ContentBlock::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        Self::Blocks(blocks)
    }
}

/// A tool call requested by the assistant.
///
/// `index` is the identity key while the call is assembled from stream
/// fragments; `arguments` stays raw text until the stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Position within the assistant turn's tool-call list
    pub index: u32,

    /// Backend-assigned call ID (may be empty)
    #[serde(default)]
    pub id: String,

    /// Name of the tool to invoke
    #[serde(default)]
    pub name: String,

    /// Arguments as raw JSON text
    #[serde(default)]
    pub arguments: String,
}

impl ToolInvocation {
    /// The identifier a tool result links back to: the call ID, or the
    /// tool name when the backend never assigned one.
    pub fn call_id(&self) -> &str {
        if self.id.is_empty() { &self.name } else { &self.id }
    }
}

/// Creation time, lifecycle state, origin, and accounting for a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub created: DateTime<Utc>,

    #[serde(default)]
    pub state: MessageState,

    /// Model/server identifier that produced or received this message
    #[serde(default)]
    pub server_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            created: Utc::now(),
            state: MessageState::Success,
            server_name: String::new(),
            usage: None,
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Text or structured content
    pub content: MessageContent,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    fn with_role(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: MessageMetadata::default(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, MessageContent::Text(content.into()))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, MessageContent::Text(content.into()))
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, MessageContent::Text(content.into()))
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolInvocation>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_state(mut self, state: MessageState) -> Self {
        self.metadata.state = state;
        self
    }

    pub fn with_server(mut self, server_name: impl Into<String>) -> Self {
        self.metadata.server_name = server_name.into();
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.metadata.usage = usage;
        self
    }

    /// The text of this message (blocks flattened).
    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// A conversation is an append-only transcript of messages.
///
/// The only removal is [`Conversation::pop_last`], which rolls back the most
/// recent message when it has the expected role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered messages
    messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added or removed
    pub updated_at: DateTime<Utc>,

    /// Optional title (auto-generated or user-set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            title: None,
        }
    }

    /// Append a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Remove the most recent message if it has the `expected` role.
    ///
    /// Returns `None` and leaves the transcript untouched otherwise.
    pub fn pop_last(&mut self, expected: Role) -> Option<Message> {
        if self.messages.last()?.role != expected {
            return None;
        }
        self.updated_at = Utc::now();
        self.messages.pop()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The most recent `n` messages; `n == 0` means the whole transcript.
    pub fn recent(&self, n: usize) -> &[Message] {
        if n == 0 || n >= self.messages.len() {
            &self.messages
        } else {
            &self.messages[self.messages.len() - n..]
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

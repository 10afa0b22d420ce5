//! # chatloop Core
//!
//! Domain types, traits, and error definitions for the chatloop conversation
//! task loop. This crate performs no network I/O: it defines the transcript,
//! the fragment and request shapes, the seams to tools and settings, and the
//! command bridge that carries exchanges to a backend host.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the loop is a trait or a channel defined here.
//! Implementations live in their respective crates. This enables:
//! - Swapping backends and tool executors without touching the loop
//! - Easy testing with scripted backends and stub tools
//! - Clean dependency graph (all crates depend inward on core)

pub mod bridge;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod settings;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bridge::{BridgeMessage, ListenerId, ListenerOptions, MessageBridge};
pub use error::{Error, ErrorReport, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{
    ContentBlock, Conversation, ConversationId, Message, MessageContent, MessageState, Role,
    ToolInvocation,
};
pub use provider::{ChatRequest, Provider, ProviderRequest, StreamChunk, ToolCallDelta, Usage};
pub use settings::{ChatSettings, ModelSettings, SettingsProvider, StaticSettings, ToolCallPolicy};
pub use tool::{Tool, ToolExecutor, ToolOutput, ToolRegistry, ToolResult};

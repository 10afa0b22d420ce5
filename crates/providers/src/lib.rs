//! LLM provider implementations and the bridge host for chatloop.
//!
//! Providers implement the `chatloop_core::Provider` trait. The
//! [`BridgeHost`] sits on the far side of the message bridge and turns
//! posted submissions into provider streams.

pub mod host;
pub mod openai_compat;

pub use host::{BridgeHost, OpenAiCompatFactory, ProviderFactory};
pub use openai_compat::OpenAiCompatProvider;

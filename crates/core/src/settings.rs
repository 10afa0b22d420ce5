//! Settings lookup for the task loop.
//!
//! The loop asks a [`SettingsProvider`] for the current model endpoint and the
//! chat settings at the start of every epoch, so a caller can switch models or
//! edit the system prompt between epochs.

use serde::{Deserialize, Serialize};

/// The model endpoint and credential currently selected.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Identifier recorded as `server_name` on transcript entries
    pub id: String,

    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    /// Model name sent to the backend
    pub model: String,
}

impl ModelSettings {
    /// A credential is usable when it has non-whitespace content.
    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// The server name recorded on messages.
    pub fn server_name(&self) -> &str {
        if self.id.is_empty() { "unknown" } else { &self.id }
    }
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_empty() { "None" } else { "[REDACTED]" },
            )
            .field("model", &self.model)
            .finish()
    }
}

/// Per-conversation request settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// How many trailing transcript messages go into each request (0 = all)
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Injected as a leading system message when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Names of tools offered to the model; `None` offers every tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_context_length() -> usize {
    20
}

impl ChatSettings {
    pub fn tool_enabled(&self, name: &str) -> bool {
        self.enabled_tools
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| n == name))
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            context_length: default_context_length(),
            system_prompt: None,
            enabled_tools: None,
        }
    }
}

/// Which invocations of a multi-call assistant turn get dispatched.
///
/// Read from the `[task_loop]` config table and handed to the task loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPolicy {
    /// Only the lowest-index invocation.
    #[default]
    First,
    /// Every invocation, one after another in index order.
    Sequential,
}

/// Source of model and chat settings.
pub trait SettingsProvider: Send + Sync {
    fn current_model(&self) -> ModelSettings;

    fn chat_settings(&self) -> ChatSettings;
}

/// Fixed settings, for embedding the loop without a config file.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    pub model: ModelSettings,
    pub chat: ChatSettings,
}

impl StaticSettings {
    pub fn new(model: ModelSettings, chat: ChatSettings) -> Self {
        Self { model, chat }
    }
}

impl SettingsProvider for StaticSettings {
    fn current_model(&self) -> ModelSettings {
        self.model.clone()
    }

    fn chat_settings(&self) -> ChatSettings {
        self.chat.clone()
    }
}

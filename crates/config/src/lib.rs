//! Configuration loading, validation, and management for chatloop.
//!
//! Loads configuration from `~/.chatloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use chatloop_core::settings::{ChatSettings, ModelSettings, SettingsProvider, ToolCallPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.chatloop/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Index into `models` of the model in use
    #[serde(default)]
    pub current_model: usize,

    /// The model registry
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,

    /// Request settings
    #[serde(default)]
    pub chat: ChatSettings,

    /// Epoch budget and retry policy
    #[serde(default)]
    pub task_loop: TaskLoopConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier recorded on transcript messages
    pub id: String,

    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model name sent to the backend
    pub model: String,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLoopConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    #[serde(default = "default_max_json_parse_retry")]
    pub max_json_parse_retry: usize,

    #[serde(default)]
    pub tool_call_policy: ToolCallPolicy,
}

fn default_max_epochs() -> usize {
    20
}
fn default_max_json_parse_retry() -> usize {
    3
}

impl Default for TaskLoopConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            max_json_parse_retry: default_max_json_parse_retry(),
            tool_call_policy: ToolCallPolicy::default(),
        }
    }
}

fn default_models() -> Vec<ModelConfig> {
    vec![ModelConfig {
        id: "openai".into(),
        base_url: "https://api.openai.com/v1".into(),
        api_key: None,
        model: "gpt-4o-mini".into(),
    }]
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.chatloop/config.toml).
    ///
    /// Environment overrides, applied to the current model:
    /// - `CHATLOOP_API_KEY`, then `OPENAI_API_KEY` (only when no key is set)
    /// - `CHATLOOP_MODEL`
    /// - `CHATLOOP_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injected for tests).
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let index = self.current_model;
        let Some(model) = self.models.get_mut(index) else {
            return;
        };

        let has_key = model.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if !has_key {
            if let Some(key) = lookup("CHATLOOP_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
                model.api_key = Some(key);
            }
        }

        if let Some(name) = lookup("CHATLOOP_MODEL") {
            model.model = name;
        }

        if let Some(url) = lookup("CHATLOOP_BASE_URL") {
            model.base_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatloop")
    }

    /// Get the configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.chat.temperature < 0.0 || self.chat.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "chat.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.task_loop.max_epochs == 0 {
            return Err(ConfigError::ValidationError(
                "task_loop.max_epochs must be at least 1".into(),
            ));
        }

        if self.task_loop.max_json_parse_retry == 0 {
            return Err(ConfigError::ValidationError(
                "task_loop.max_json_parse_retry must be at least 1".into(),
            ));
        }

        if self.current_model >= self.models.len() {
            return Err(ConfigError::ValidationError(format!(
                "current_model {} is out of range ({} models configured)",
                self.current_model,
                self.models.len()
            )));
        }

        Ok(())
    }

    /// Check if the current model has a usable API key.
    pub fn has_api_key(&self) -> bool {
        self.current_model().has_credential()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl SettingsProvider for AppConfig {
    fn current_model(&self) -> ModelSettings {
        self.models
            .get(self.current_model)
            .map(|m| ModelSettings {
                id: m.id.clone(),
                base_url: m.base_url.clone(),
                api_key: m.api_key.clone().unwrap_or_default(),
                model: m.model.clone(),
            })
            .unwrap_or_default()
    }

    fn chat_settings(&self) -> ChatSettings {
        self.chat.clone()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            current_model: 0,
            models: default_models(),
            chat: ChatSettings::default(),
            task_loop: TaskLoopConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

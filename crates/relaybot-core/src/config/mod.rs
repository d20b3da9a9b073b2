//! Configuration module for relaybot.
//!
//! Loads typed configuration from `relaybot.json` or
//! `~/.relaybot/config.json`. All fields use `serde` with defaults, so a
//! partial file (or none at all) still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{default_models, ModelSpec};

/// Placeholder written into the starter template.
pub const PLACEHOLDER_KEY: &str = "sk-or-v1-YOUR_KEY_HERE";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub completion: CompletionConfig,
    pub models: ModelsConfig,
    pub session: SessionConfig,
    pub history: HistoryConfig,
    pub tools: ToolsConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// Priority:
    /// 1. `relaybot.json` in the current directory
    /// 2. `~/.relaybot/config.json`
    /// 3. built-in defaults
    ///
    /// `OPENROUTER_API_KEY` and `OPENROUTER_BASE_URL` override the file.
    pub fn load() -> anyhow::Result<Self> {
        let paths = [PathBuf::from("relaybot.json"), Self::default_path()];

        let mut config = match paths.iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::debug!("Loading config from: {}", path.display());
                Self::load_from(path)?
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                Config::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path (no environment overrides).
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                tracing::info!("Using OpenRouter API key from environment variable");
                self.provider.api_key = key;
            }
        }
        if let Ok(base) = std::env::var("OPENROUTER_BASE_URL") {
            if !base.trim().is_empty() {
                tracing::info!(base = %base, "Using OpenRouter base URL from environment variable");
                self.provider.api_base = base;
            }
        }
    }

    /// Get the config directory (`~/.relaybot`).
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relaybot")
    }

    /// Get the default config file path (`~/.relaybot/config.json`).
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Resolved history directory (expands a leading `~/`).
    pub fn history_dir(&self) -> PathBuf {
        expand_home(&self.history.dir)
    }

    /// Write the starter config template to disk.
    pub fn write_default_template() -> anyhow::Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut template = Config::default();
        template.provider.api_key = PLACEHOLDER_KEY.into();

        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }

    /// Validate configuration and return actionable error messages.
    ///
    /// Checks that:
    /// - The API key is set and not a placeholder
    /// - The model catalog is non-empty with unique ids
    /// - Numeric limits are usable
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.provider.has_real_key() {
            errors.push(
                "No OpenRouter API key configured. \
                 Set provider.apiKey in config.json or export OPENROUTER_API_KEY."
                    .into(),
            );
        }

        if self.models.is_empty() {
            errors.push("models is empty. Configure at least one model.".into());
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models.0 {
            if model.id.trim().is_empty() {
                errors.push("A model entry has an empty id.".into());
            } else if !seen.insert(model.id.as_str()) {
                errors.push(format!("Model id '{}' is listed more than once.", model.id));
            }
        }

        if self.gateway.port == 0 {
            errors.push("gateway.port must be non-zero.".into());
        }
        if self.provider.timeout_seconds == 0 {
            errors.push("provider.timeoutSeconds must be at least 1.".into());
        }
        if self.completion.max_tokens == 0 {
            errors.push("completion.maxTokens must be at least 1.".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(raw)
    }
}

// ── Provider Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_base: String,
    /// Sent as `HTTP-Referer`.
    pub referer: String,
    /// Sent as `X-Title`.
    pub title: String,
    /// Upper bound for each completion call.
    pub timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: crate::provider::openai::DEFAULT_BASE_URL.into(),
            referer: "http://localhost:8000".into(),
            title: "Agent LLM POC".into(),
            timeout_seconds: 30,
        }
    }
}

impl ProviderConfig {
    /// Whether the key is non-empty and not a template placeholder.
    pub fn has_real_key(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && !key.contains("YOUR_")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

// ── Completion Configuration ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompletionConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Restrict fallback rounds to free models.
    pub free_only: bool,
    /// Default for requests that do not say whether to offer tools.
    pub use_tools: bool,
    pub system_prompt: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            free_only: true,
            use_tools: true,
            system_prompt: "You are a helpful AI assistant. \
                Use the available tools when they help answer the user's question, \
                and answer concisely."
                .into(),
        }
    }
}

// ── Models Configuration ────────────────────────────────────────────

/// Ordered model catalog seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelsConfig(pub Vec<ModelSpec>);

impl Default for ModelsConfig {
    fn default() -> Self {
        Self(default_models())
    }
}

impl ModelsConfig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Session / History Configuration ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub ttl_seconds: u64,
    /// Messages retained per session.
    pub max_messages: usize,
    /// Recent messages fed into each completion.
    pub history_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_messages: 20,
            history_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryConfig {
    pub dir: String,
    /// Persist transcripts on a spawned task instead of inline.
    pub background_writes: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: "~/.relaybot/history".into(),
            background_writes: true,
        }
    }
}

// ── Tools Configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    pub web_search: WebSearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSearchConfig {
    pub enabled: bool,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: 5,
        }
    }
}

// ── Gateway Configuration ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider.api_base, "https://openrouter.ai/api/v1");
        assert_eq!(config.provider.timeout_seconds, 30);
        assert_eq!(config.completion.max_tokens, 2000);
        assert!(config.completion.free_only);
        assert_eq!(config.models.0.len(), 7);
        assert_eq!(config.session.max_messages, 20);
        assert_eq!(config.gateway.port, 8000);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let json = r#"{"provider": {"apiKey": "test-key"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.provider.api_key, "test-key");
        assert_eq!(config.provider.title, "Agent LLM POC");
        assert_eq!(config.models, ModelsConfig::default());
    }

    #[test]
    fn test_deserialize_custom_models() {
        let json = r#"{
            "models": [
                {"id": "a/one:free", "name": "One", "supportsTools": true, "isFree": true, "priority": 0},
                {"id": "b/two", "priority": 3}
            ],
            "session": {"historyWindow": 4},
            "tools": {"webSearch": {"enabled": false}}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.models.0.len(), 2);
        assert!(config.models.0[0].supports_tools);
        assert!(!config.models.0[1].is_free);
        assert_eq!(config.session.history_window, 4);
        assert_eq!(config.session.ttl_seconds, 3600);
        assert!(!config.tools.web_search.enabled);
        assert_eq!(config.tools.web_search.max_results, 5);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = Config::default();
        config.provider.api_key = PLACEHOLDER_KEY.into();
        config.models.0.push(config.models.0[0].clone());
        config.gateway.port = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("API key"));
        assert!(errors[1].contains("more than once"));
    }

    #[test]
    fn test_validate_accepts_real_key() {
        let mut config = Config::default();
        config.provider.api_key = "sk-or-v1-abc123".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_round_trips_template_shape() {
        let dir = std::env::temp_dir().join(format!("relaybot_config_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"gateway": {"port": 9001}, "completion": {"temperature": 0.2}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.gateway.port, 9001);
        assert!((config.completion.temperature - 0.2).abs() < f32::EPSILON);

        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_history_dir_expands_home() {
        let mut config = Config::default();
        config.history.dir = "/tmp/relaybot-history".into();
        assert_eq!(config.history_dir(), PathBuf::from("/tmp/relaybot-history"));
        config.history.dir = "~/h".into();
        assert!(config.history_dir().ends_with("h"));
        assert!(!config.history_dir().starts_with("~"));
    }
}

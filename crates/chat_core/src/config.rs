use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::config_json_path;

pub const DEFAULT_PROVIDER: &str = "echo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

const CONFIG_FILE_PATH: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider id used for new messages
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Longest wait for the next chunk before a stream is treated as failed
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub context_enabled: bool,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub providers: ProviderConfigs,
    /// Price per 1000 tokens, keyed by model name
    #[serde(default)]
    pub pricing: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfigs {
    #[serde(default)]
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_stream_idle_timeout_secs() -> u64 {
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream_idle_timeout_secs: DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
            context_enabled: true,
            data_dir: None,
            providers: ProviderConfigs::default(),
            pricing: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from ~/.workspace-chat/config.json, falling back to ./config.toml,
    /// then apply environment overrides.
    pub fn new() -> Self {
        let mut config = Self::load_from(&config_json_path(), Path::new(CONFIG_FILE_PATH));
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn load_from(json_path: &Path, toml_path: &Path) -> Self {
        if json_path.exists() {
            match std::fs::read_to_string(json_path) {
                Ok(content) => match serde_json::from_str::<Config>(&content) {
                    Ok(config) => {
                        tracing::debug!("Loaded config from {}", json_path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", json_path.display(), e)
                    }
                },
                Err(e) => tracing::warn!("Failed to read {}: {}", json_path.display(), e),
            }
        }

        if toml_path.exists() {
            match std::fs::read_to_string(toml_path) {
                Ok(content) => match toml::from_str::<Config>(&content) {
                    Ok(config) => {
                        tracing::debug!("Loaded config from {}", toml_path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", toml_path.display(), e)
                    }
                },
                Err(e) => tracing::warn!("Failed to read {}: {}", toml_path.display(), e),
            }
        }

        Config::default()
    }

    /// Apply environment-style overrides. `lookup` maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("CHAT_PROVIDER").filter(|v| !v.trim().is_empty()) {
            self.provider = provider.trim().to_string();
        }
        if let Some(model) = lookup("CHAT_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = Some(model.trim().to_string());
        }
        if let Some(api_key) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.providers
                .openai
                .get_or_insert_with(OpenAIConfig::default)
                .api_key = api_key;
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.providers
                .openai
                .get_or_insert_with(OpenAIConfig::default)
                .base_url = Some(base_url);
        }
        if let Some(timeout) = lookup("CHAT_STREAM_IDLE_TIMEOUT_SECS") {
            match timeout.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.stream_idle_timeout_secs = secs,
                _ => tracing::warn!(
                    "Ignoring invalid CHAT_STREAM_IDLE_TIMEOUT_SECS value: {}",
                    timeout
                ),
            }
        }
        if let Some(enabled) = lookup("CHAT_CONTEXT_ENABLED") {
            self.context_enabled = parse_bool_env(&enabled);
        }
    }
}

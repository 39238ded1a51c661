use std::collections::HashMap;
use std::time::Duration;

use chat_core::config::{
    DEFAULT_MAX_TOKENS, DEFAULT_PROVIDER, DEFAULT_STREAM_IDLE_TIMEOUT_SECS, DEFAULT_TEMPERATURE,
};
use chat_core::Config;

/// Shortest idle timeout a pipeline will run with.
pub const MIN_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the chat pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Provider id resolved through the adapter registry
    pub provider: String,
    /// Model override passed to the adapter; `None` uses the adapter default
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Longest gap allowed between two chunks before the stream is failed
    pub stream_idle_timeout: Duration,
    /// If false, no context block is prepended to outgoing prompts
    pub context_enabled: bool,
    /// Price per 1000 tokens keyed by model name
    pub pricing: HashMap<String, f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
            context_enabled: true,
            pricing: HashMap::new(),
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            provider: config.provider.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream_idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs)
                .max(MIN_STREAM_IDLE_TIMEOUT),
            context_enabled: config.context_enabled,
            pricing: config.pricing.clone(),
        }
    }
}

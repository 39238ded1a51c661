//! Provider Factory
//!
//! Builds the adapter registry from configuration.

use std::sync::Arc;
use std::time::Duration;

use chat_core::Config;

use crate::providers::{EchoAdapter, OpenAIAdapter};
use crate::registry::AdapterRegistry;

/// Providers this crate knows how to build
pub const AVAILABLE_PROVIDERS: &[&str] = &["echo", "openai"];

const ECHO_CHUNK_DELAY: Duration = Duration::from_millis(25);

/// Register every adapter the configuration supports.
///
/// `echo` is always available. `openai` needs a non-empty API key.
pub fn build_registry(config: &Config) -> AdapterRegistry {
    let registry = AdapterRegistry::new();

    registry.register(
        "echo",
        Arc::new(EchoAdapter::new().with_delay(ECHO_CHUNK_DELAY)),
    );

    match config.providers.openai.as_ref() {
        Some(openai) if !openai.api_key.trim().is_empty() => {
            let mut adapter = OpenAIAdapter::new(&openai.api_key);

            if let Some(base_url) = openai.base_url.as_deref().filter(|u| !u.is_empty()) {
                adapter = adapter.with_base_url(base_url);
            }

            if let Some(model) = openai.model.as_deref().filter(|m| !m.is_empty()) {
                adapter = adapter.with_model(model);
            }

            registry.register("openai", Arc::new(adapter));
        }
        Some(_) => {
            tracing::warn!("OpenAI configuration present but API key is empty; provider disabled");
        }
        None => {
            tracing::debug!("No OpenAI configuration found");
        }
    }

    if !registry.contains(&config.provider) {
        tracing::warn!(
            "Configured provider '{}' is not available. Available providers: {}",
            config.provider,
            registry.providers().join(", ")
        );
    }

    registry
}

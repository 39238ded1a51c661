use async_trait::async_trait;
use reqwest::Client;

use crate::adapter::{AdapterError, ChatAdapter, ChunkStream, Result};
use crate::types::{HistoryMessage, StreamOptions};

use super::common::openai_compat::{build_openai_compat_body, parse_openai_compat_sse_data};
use super::common::sse::chunk_stream_from_sse;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Adapter for any OpenAI-compatible chat completions endpoint.
pub struct OpenAIAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl ChatAdapter for OpenAIAdapter {
    async fn stream_chat(
        &self,
        history: &[HistoryMessage],
        options: &StreamOptions,
    ) -> Result<ChunkStream> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        if options.model.is_some() {
            tracing::debug!(
                "OpenAI adapter using override model '{}' (default: '{}')",
                model,
                self.model
            );
        }

        let body = build_openai_compat_body(model, history, options);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(AdapterError::Api(format!("HTTP {}: {}", status, text)));
        }

        Ok(chunk_stream_from_sse(response, parse_openai_compat_sse_data))
    }

    fn default_model(&self) -> Option<&str> {
        Some(&self.model)
    }
}

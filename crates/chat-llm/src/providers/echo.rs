use std::time::Duration;

use async_trait::async_trait;
use chat_core::Role;

use crate::adapter::{AdapterError, ChatAdapter, ChunkStream, Result};
use crate::types::{ChatChunk, HistoryMessage, StreamOptions};

/// Offline adapter that streams the last user message back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoAdapter {
    delay: Duration,
}

impl EchoAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between chunks
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ChatAdapter for EchoAdapter {
    async fn stream_chat(
        &self,
        history: &[HistoryMessage],
        _options: &StreamOptions,
    ) -> Result<ChunkStream> {
        let prompt = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let words: Vec<String> = prompt
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        let delay = self.delay;

        let stream = async_stream::stream! {
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<_, AdapterError>(ChatChunk::content(word));
            }
            yield Ok::<_, AdapterError>(ChatChunk::finish("stop"));
        };

        Ok(Box::pin(stream))
    }

    fn default_model(&self) -> Option<&str> {
        Some("echo")
    }
}

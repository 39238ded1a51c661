use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::types::{ChatChunk, HistoryMessage, StreamOptions};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("No chunk received within {0:?}")]
    IdleTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Finite, single-use sequence of chunks. Once drained or dropped, a new
/// `stream_chat` call is needed to retry.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stream a chat completion
    ///
    /// # Arguments
    /// * `history` - Conversation so far, oldest first; the last entry is the prompt
    /// * `options` - Sampling options and an optional model override
    async fn stream_chat(
        &self,
        history: &[HistoryMessage],
        options: &StreamOptions,
    ) -> Result<ChunkStream>;

    /// Model used when `options.model` is not set
    fn default_model(&self) -> Option<&str> {
        None
    }
}

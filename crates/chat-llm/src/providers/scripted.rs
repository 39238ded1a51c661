//! Deterministic adapter that replays a fixed script of stream steps.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{AdapterError, ChatAdapter, ChunkStream, Result};
use crate::types::{ChatChunk, HistoryMessage, StreamOptions};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(ChatChunk),
    /// Yield a stream error and end the stream
    Error(String),
    Delay(Duration),
    /// Stop yielding without ending the stream
    Hang,
}

/// A single `stream_chat` invocation as seen by the adapter.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub history: Vec<HistoryMessage>,
    pub options: StreamOptions,
}

pub struct ScriptedAdapter {
    steps: Vec<ScriptStep>,
    open_error: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedAdapter {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            open_error: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Content chunks followed by `finish_reason = "stop"`.
    pub fn from_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps: Vec<ScriptStep> = chunks
            .into_iter()
            .map(|c| ScriptStep::Chunk(ChatChunk::content(c)))
            .collect();
        steps.push(ScriptStep::Chunk(ChatChunk::finish("stop")));
        Self::new(steps)
    }

    /// Adapter whose `stream_chat` call itself fails.
    pub fn failing_on_open(message: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            open_error: Some(message.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChatAdapter for ScriptedAdapter {
    async fn stream_chat(
        &self,
        history: &[HistoryMessage],
        options: &StreamOptions,
    ) -> Result<ChunkStream> {
        self.calls.lock().push(RecordedCall {
            history: history.to_vec(),
            options: options.clone(),
        });

        if let Some(message) = &self.open_error {
            return Err(AdapterError::Api(message.clone()));
        }

        let steps = self.steps.clone();
        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    ScriptStep::Chunk(chunk) => {
                        yield Ok::<_, AdapterError>(chunk);
                    }
                    ScriptStep::Error(message) => {
                        yield Err(AdapterError::Stream(message));
                        break;
                    }
                    ScriptStep::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                    ScriptStep::Hang => {
                        futures::future::pending::<()>().await;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn default_model(&self) -> Option<&str> {
        Some("scripted")
    }
}

//! Folds adapter chunks into the stored assistant message.

use std::collections::HashMap;
use std::sync::Arc;

use chat_core::{Message, MessageMetadata};
use chat_llm::ChatChunk;

use crate::error::StoreError;
use crate::store::ConversationStore;
use crate::streaming::{SessionHandle, StreamSession, StreamingManager};

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Session was cancelled; the message is untouched
    Dropped,
    /// Chunk carried neither content nor a finish reason
    Ignored,
    Applied,
    Finalized(MessageMetadata),
}

pub struct MessageReconciler {
    store: Arc<ConversationStore>,
    streams: Arc<StreamingManager>,
    pricing: HashMap<String, f64>,
}

impl MessageReconciler {
    pub fn new(store: Arc<ConversationStore>, streams: Arc<StreamingManager>) -> Self {
        Self {
            store,
            streams,
            pricing: HashMap::new(),
        }
    }

    /// Per-1000-token prices keyed by model name.
    pub fn with_pricing(mut self, pricing: HashMap<String, f64>) -> Self {
        self.pricing = pricing;
        self
    }

    /// Apply one chunk to `message_id`.
    ///
    /// The cancellation check runs inside the store write, so a chunk racing a
    /// cancel either lands fully before it or not at all.
    pub fn apply_chunk(
        &self,
        conversation_id: &str,
        message_id: &str,
        session: &SessionHandle,
        chunk: &ChatChunk,
    ) -> Result<ChunkOutcome, StoreError> {
        if session.is_cancelled() {
            return Ok(ChunkOutcome::Dropped);
        }

        let text = chunk.text();
        let finishing = chunk.is_terminal();
        if text.is_none() && !finishing {
            return Ok(ChunkOutcome::Ignored);
        }

        let outcome = self
            .store
            .try_update_message(conversation_id, message_id, |message| {
                if session.is_cancelled() {
                    return None;
                }
                if let Some(text) = text {
                    if session.record_first_chunk() {
                        tracing::debug!(
                            "[{}] First chunk after {} ms",
                            message_id,
                            session.elapsed().as_millis()
                        );
                    }
                    message.content.push_str(text);
                }
                if finishing {
                    Some(ChunkOutcome::Finalized(self.complete(message, session)))
                } else {
                    message.is_streaming = true;
                    Some(ChunkOutcome::Applied)
                }
            })?
            .unwrap_or(ChunkOutcome::Dropped);

        if let ChunkOutcome::Finalized(metadata) = &outcome {
            self.streams.finish_stream(session);
            tracing::info!(
                "[{}] Stream finalized ({:?}): {} tokens in {} ms",
                message_id,
                chunk.finish_reason,
                metadata.token_count.unwrap_or(0),
                metadata.response_time.unwrap_or(0)
            );
        }

        Ok(outcome)
    }

    /// Finalize a message whose stream ended without a finish reason.
    pub fn finalize(
        &self,
        conversation_id: &str,
        message_id: &str,
        session: &SessionHandle,
    ) -> Result<Option<MessageMetadata>, StoreError> {
        let metadata = self
            .store
            .try_update_message(conversation_id, message_id, |message| {
                if session.is_cancelled() {
                    return None;
                }
                Some(self.complete(message, session))
            })?;
        if metadata.is_some() {
            self.streams.finish_stream(session);
        }
        Ok(metadata)
    }

    /// Stop streaming a message as-is, without metadata.
    pub fn freeze(&self, conversation_id: &str, message_id: &str) -> Result<(), StoreError> {
        self.store
            .update_message_by_id(conversation_id, message_id, |message| {
                message.is_streaming = false;
            })
    }

    fn complete(&self, message: &mut Message, session: &StreamSession) -> MessageMetadata {
        let token_count = message.content.split_whitespace().count();
        let cost = message
            .model
            .as_deref()
            .and_then(|model| self.pricing.get(model))
            .map(|price| token_count as f64 / 1000.0 * price);

        let metadata = MessageMetadata {
            token_count: Some(token_count),
            response_time: Some(session.elapsed().as_millis() as u64),
            cost,
        };
        message.is_streaming = false;
        message.metadata = Some(metadata.clone());
        metadata
    }
}

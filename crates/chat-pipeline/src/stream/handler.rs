use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;

use chat_core::MessageMetadata;
use chat_llm::{AdapterError, ChunkStream};

use crate::error::StoreError;
use crate::events::PipelineEvent;
use crate::reconciler::{ChunkOutcome, MessageReconciler};
use crate::streaming::SessionHandle;

/// How a chunk stream stopped being consumed.
#[derive(Debug)]
pub enum StreamEnd {
    /// A chunk carried a finish reason and the message was finalized
    Finalized(MessageMetadata),
    /// The adapter closed the stream without a finish reason
    Exhausted,
    Cancelled,
    Failed(AdapterError),
}

/// Drive `stream` into the target message until it finishes, fails, idles
/// out, or the session is cancelled. Applied content is broadcast on
/// `event_tx`.
///
/// Waiting for the next chunk is the only suspension point; it is raced
/// against cancellation and `idle_timeout`.
pub async fn consume_chunk_stream(
    mut stream: ChunkStream,
    reconciler: &MessageReconciler,
    event_tx: &broadcast::Sender<PipelineEvent>,
    session: &SessionHandle,
    conversation_id: &str,
    message_id: &str,
    idle_timeout: Duration,
) -> Result<StreamEnd, StoreError> {
    let mut chunk_count = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancelled() => {
                tracing::debug!("[{}] Stream cancelled after {} chunks", message_id, chunk_count);
                return Ok(StreamEnd::Cancelled);
            }
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                tracing::warn!(
                    "[{}] No chunk received within {:?}; abandoning stream",
                    message_id,
                    idle_timeout
                );
                return Ok(StreamEnd::Failed(AdapterError::IdleTimeout(idle_timeout)));
            }
            Ok(None) => {
                tracing::debug!("[{}] Chunk stream ended after {} chunks", message_id, chunk_count);
                return Ok(StreamEnd::Exhausted);
            }
            Ok(Some(Err(error))) => {
                tracing::error!("[{}] Stream error: {}", message_id, error);
                return Ok(StreamEnd::Failed(error));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        chunk_count += 1;
        let outcome = reconciler.apply_chunk(conversation_id, message_id, session, &chunk)?;

        if matches!(outcome, ChunkOutcome::Applied | ChunkOutcome::Finalized(_)) {
            if let Some(text) = chunk.text() {
                // No subscribers is fine
                let _ = event_tx.send(PipelineEvent::Chunk {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.to_string(),
                    content: text.to_string(),
                });
            }
        }

        match outcome {
            ChunkOutcome::Dropped => return Ok(StreamEnd::Cancelled),
            ChunkOutcome::Finalized(metadata) => return Ok(StreamEnd::Finalized(metadata)),
            ChunkOutcome::Applied | ChunkOutcome::Ignored => {}
        }
    }
}

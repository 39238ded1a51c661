//! Decoding of streamed chat completions delivered as server-sent events.
//!
//! The returned stream ends at the protocol terminator, after the first chunk
//! that carries a finish reason, or after the first error, whichever comes
//! first. Anything the server sends past that point is never read.

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Response;

use crate::adapter::{AdapterError, ChunkStream, Result};
use crate::types::ChatChunk;

/// What one SSE `data:` payload means for the response.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Chunk(ChatChunk),
    /// Keep-alives, role-only deltas and other payloads with nothing to apply
    Skip,
    /// End-of-stream marker such as `[DONE]`
    Done,
}

/// Turn an SSE response into a [`ChunkStream`], decoding each payload with `decode`.
pub fn chunk_stream_from_sse<D>(response: Response, mut decode: D) -> ChunkStream
where
    D: FnMut(&str) -> Result<SseFrame> + Send + 'static,
{
    let mut events = Box::pin(response.bytes_stream().eventsource());

    Box::pin(async_stream::stream! {
        while let Some(event) = events.next().await {
            let data = match event {
                Ok(event) => event.data,
                Err(e) => {
                    yield Err(AdapterError::Stream(e.to_string()));
                    break;
                }
            };

            match decode(&data) {
                Ok(SseFrame::Chunk(chunk)) => {
                    let finished = chunk.is_terminal();
                    yield Ok(chunk);
                    if finished {
                        break;
                    }
                }
                Ok(SseFrame::Skip) => {}
                Ok(SseFrame::Done) => break,
                Err(AdapterError::Stream(message)) => {
                    yield Err(AdapterError::Stream(message));
                    break;
                }
                Err(other) => {
                    tracing::debug!("Undecodable SSE payload: {}", data);
                    yield Err(AdapterError::Stream(other.to_string()));
                    break;
                }
            }
        }
    })
}

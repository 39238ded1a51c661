//! OpenAI-compatible request/stream helpers.
//!
//! Many providers accept the chat completions request shape and stream
//! `choices[].delta` objects over SSE. Only `role`/`content` are sent; message
//! ids and timestamps stay internal.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::adapter::Result;
use crate::types::{ChatChunk, HistoryMessage, StreamOptions};

use super::sse::SseFrame;

pub fn history_to_openai_compat_json(history: &[HistoryMessage]) -> Vec<Value> {
    history
        .iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect()
}

/// Build a streaming chat completions request body.
pub fn build_openai_compat_body(
    model: &str,
    history: &[HistoryMessage],
    options: &StreamOptions,
) -> Value {
    json!({
        "model": model,
        "messages": history_to_openai_compat_json(history),
        "stream": true,
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
    })
}

#[derive(Debug, Deserialize)]
struct OpenAICompatStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAICompatChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatChoice {
    #[serde(default)]
    delta: OpenAICompatDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAICompatDelta {
    content: Option<String>,
}

/// Parse one SSE `data:` payload.
///
/// - `"[DONE]"` -> [`SseFrame::Done`]
/// - empty payloads and deltas with neither content nor finish reason -> [`SseFrame::Skip`]
/// - invalid JSON -> error
pub fn parse_openai_compat_sse_data(data: &str) -> Result<SseFrame> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseFrame::Done);
    }
    if data.is_empty() {
        return Ok(SseFrame::Skip);
    }

    let chunk: OpenAICompatStreamChunk = serde_json::from_str(data)?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseFrame::Skip);
    };

    let content = choice.delta.content.filter(|c| !c.is_empty());
    if content.is_none() && choice.finish_reason.is_none() {
        return Ok(SseFrame::Skip);
    }

    Ok(SseFrame::Chunk(ChatChunk {
        content,
        finish_reason: choice.finish_reason,
    }))
}

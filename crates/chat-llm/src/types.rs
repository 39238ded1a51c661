use chat_core::{Message, Role};
use serde::{Deserialize, Serialize};

/// One unit of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ChatChunk {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: None,
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            content: None,
            finish_reason: Some(reason.into()),
        }
    }

    /// Non-empty content carried by this chunk
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.is_empty())
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

impl From<&Message> for HistoryMessage {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            temperature: chat_core::config::DEFAULT_TEMPERATURE,
            max_tokens: chat_core::config::DEFAULT_MAX_TOKENS,
            model: None,
        }
    }
}

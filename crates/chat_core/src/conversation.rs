//! Conversation - an ordered list of messages plus the project it belongs to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

pub const DEFAULT_TITLE: &str = "New Chat";
const MAX_TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub context: ConversationContext,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            context: ConversationContext::default(),
        }
    }

    pub fn with_context(mut self, context: ConversationContext) -> Self {
        self.context = context;
        self
    }

    /// Advance `updated_at`, never moving it backwards or behind `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(at).max(Utc::now());
    }

    pub fn push_message(&mut self, message: Message) {
        let timestamp = message.timestamp;
        self.messages.push(message);
        self.touch(timestamp);
    }

    pub fn position_of(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.position_of(message_id).is_some()
    }

    /// Ids of messages that are still marked as streaming.
    pub fn streaming_message_ids(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.is_streaming)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn export(&self) -> ExportedConversation {
        ExportedConversation {
            title: self.title.clone(),
            messages: self.messages.clone(),
            created_at: self.created_at,
            context: self.context.clone(),
            exported_at: Utc::now(),
        }
    }
}

/// Download format consumed by external viewers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportedConversation {
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub context: ConversationContext,
    pub exported_at: DateTime<Utc>,
}

/// Conversation title from the first user message: its first non-blank line,
/// truncated to 50 characters.
pub fn derive_title(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();

    if line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    if line.chars().count() > MAX_TITLE_CHARS {
        let truncated: String = line.chars().take(MAX_TITLE_CHARS).collect();
        format!("{}...", truncated.trim_end())
    } else {
        line.to_string()
    }
}

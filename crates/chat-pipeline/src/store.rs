//! Conversation store.
//!
//! Owns every conversation and its messages. Message updates are by-id
//! replace under the conversation's map entry, so concurrent streams writing
//! different messages never interfere.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use chat_core::{Conversation, ConversationContext, ExportedConversation, Message};

use crate::error::StoreError;
use crate::persistence::Persistence;

pub const CONVERSATIONS_KEY: &str = "conversations";
pub const ACTIVE_CONVERSATION_KEY: &str = "active_conversation";

pub struct ConversationStore {
    conversations: DashMap<String, Conversation>,
    active_id: RwLock<Option<String>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// In-memory store without persistence.
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
            active_id: RwLock::new(None),
            persistence: None,
        }
    }

    /// Load persisted state and keep saving through `persistence`.
    ///
    /// Unreadable state is logged and the store starts empty.
    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let store = Self {
            conversations: DashMap::new(),
            active_id: RwLock::new(None),
            persistence: Some(persistence.clone()),
        };

        match persistence.load(CONVERSATIONS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Conversation>>(&raw) {
                Ok(conversations) => {
                    for mut conversation in conversations {
                        normalize_streaming(&mut conversation);
                        store
                            .conversations
                            .insert(conversation.id.clone(), conversation);
                    }
                    tracing::info!("Loaded {} conversations", store.conversations.len());
                }
                Err(e) => {
                    tracing::warn!("Failed to parse persisted conversations: {}", e);
                }
            },
            Ok(None) => {
                tracing::debug!("No persisted conversations found");
            }
            Err(e) => {
                tracing::warn!("Failed to load conversations: {}", e);
            }
        }

        match persistence.load(ACTIVE_CONVERSATION_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Option<String>>(&raw) {
                Ok(Some(id)) if store.conversations.contains_key(&id) => {
                    *store.active_id.write() = Some(id);
                }
                Ok(Some(id)) => {
                    tracing::warn!("Persisted active conversation {} no longer exists", id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to parse persisted active conversation: {}", e);
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Failed to load active conversation: {}", e);
            }
        }

        store
    }

    pub fn create_conversation(
        &self,
        title: impl Into<String>,
        context: ConversationContext,
    ) -> Conversation {
        let conversation = Conversation::new(title).with_context(context);
        self.conversations
            .insert(conversation.id.clone(), conversation.clone());
        tracing::debug!("[{}] Conversation created", conversation.id);
        conversation
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.value().clone())
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    /// All conversations, most recently updated first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn set_active(&self, conversation_id: &str) -> Result<(), StoreError> {
        if !self.contains(conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        *self.active_id.write() = Some(conversation_id.to_string());
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.active_id.read().clone()
    }

    pub fn active(&self) -> Option<Conversation> {
        self.active_id().and_then(|id| self.get(&id))
    }

    pub fn rename(&self, conversation_id: &str, title: impl Into<String>) -> Result<(), StoreError> {
        let mut conversation = self.entry_mut(conversation_id)?;
        conversation.title = title.into();
        conversation.touch(Utc::now());
        Ok(())
    }

    /// Remove a conversation, clearing the active id if it pointed at it.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let (_, conversation) = self
            .conversations
            .remove(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;

        let mut active = self.active_id.write();
        if active.as_deref() == Some(conversation_id) {
            *active = None;
        }
        Ok(conversation)
    }

    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.conversations
            .get(conversation_id)
            .and_then(|c| c.message(message_id).cloned())
    }

    /// Id of the conversation holding `message_id`, preferring the active one.
    pub fn conversation_of(&self, message_id: &str) -> Option<String> {
        if let Some(active) = self.active_id() {
            if self
                .conversations
                .get(&active)
                .is_some_and(|c| c.contains_message(message_id))
            {
                return Some(active);
            }
        }
        self.conversations
            .iter()
            .find(|entry| entry.contains_message(message_id))
            .map(|entry| entry.key().clone())
    }

    pub fn append_message(&self, conversation_id: &str, message: Message) -> Result<(), StoreError> {
        self.ensure_unique(conversation_id, &message.id)?;
        let mut conversation = self.entry_mut(conversation_id)?;
        if conversation.contains_message(&message.id) {
            return Err(StoreError::DuplicateMessageId(message.id));
        }
        conversation.push_message(message);
        Ok(())
    }

    /// Insert `message` directly after `after_id`.
    pub fn insert_message_after(
        &self,
        conversation_id: &str,
        after_id: &str,
        message: Message,
    ) -> Result<(), StoreError> {
        self.ensure_unique(conversation_id, &message.id)?;
        let mut conversation = self.entry_mut(conversation_id)?;
        if conversation.contains_message(&message.id) {
            return Err(StoreError::DuplicateMessageId(message.id));
        }
        let position = conversation
            .position_of(after_id)
            .ok_or_else(|| StoreError::MessageNotFound(after_id.to_string()))?;
        let timestamp = message.timestamp;
        conversation.messages.insert(position + 1, message);
        conversation.touch(timestamp);
        Ok(())
    }

    /// Remove a message, returning its former position.
    pub fn remove_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(usize, Message), StoreError> {
        let mut conversation = self.entry_mut(conversation_id)?;
        let position = conversation
            .position_of(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        let message = conversation.messages.remove(position);
        conversation.touch(Utc::now());
        Ok((position, message))
    }

    /// Replace a message by id with the result of `update`.
    pub fn update_message_by_id<F, R>(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: F,
    ) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Message) -> R,
    {
        self.try_update_message(conversation_id, message_id, |message| Some(update(message)))?
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))
    }

    /// Like [`update_message_by_id`](Self::update_message_by_id), but the
    /// closure may decline by returning `None`, in which case nothing changes.
    ///
    /// The closure runs while the conversation entry is locked, so any check it
    /// makes is atomic with the write.
    pub fn try_update_message<F, R>(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: F,
    ) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut Message) -> Option<R>,
    {
        let mut conversation = self.entry_mut(conversation_id)?;
        let position = conversation
            .position_of(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        let mut updated = conversation.messages[position].clone();
        let Some(result) = update(&mut updated) else {
            return Ok(None);
        };
        // The closure must not change identity; re-check before replacing.
        if updated.id != message_id {
            return Err(StoreError::MessageNotFound(message_id.to_string()));
        }
        conversation.messages[position] = updated;
        conversation.touch(Utc::now());
        Ok(Some(result))
    }

    pub fn export(&self, conversation_id: &str) -> Result<ExportedConversation, StoreError> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.export())
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))
    }

    pub fn export_json(&self, conversation_id: &str) -> Result<String, StoreError> {
        let exported = self.export(conversation_id)?;
        serde_json::to_string_pretty(&exported)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Save every conversation and the active id. Failures are logged only.
    pub fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        conversations.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        match serde_json::to_string(&conversations) {
            Ok(raw) => {
                if let Err(e) = persistence.save(CONVERSATIONS_KEY, &raw) {
                    tracing::warn!("Failed to save conversations: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to serialize conversations: {}", e);
            }
        }

        match serde_json::to_string(&self.active_id()) {
            Ok(raw) => {
                if let Err(e) = persistence.save(ACTIVE_CONVERSATION_KEY, &raw) {
                    tracing::warn!("Failed to save active conversation: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to serialize active conversation: {}", e);
            }
        }
    }

    fn entry_mut(
        &self,
        conversation_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Conversation>, StoreError> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))
    }

    // Checks the other conversations; the target one is checked under its lock.
    fn ensure_unique(&self, conversation_id: &str, message_id: &str) -> Result<(), StoreError> {
        let taken = self
            .conversations
            .iter()
            .any(|entry| entry.key() != conversation_id && entry.contains_message(message_id));
        if taken {
            return Err(StoreError::DuplicateMessageId(message_id.to_string()));
        }
        Ok(())
    }
}

fn normalize_streaming(conversation: &mut Conversation) {
    for message in conversation.messages.iter_mut().filter(|m| m.is_streaming) {
        tracing::debug!(
            "[{}] Clearing stale streaming flag on message {}",
            conversation.id,
            message.id
        );
        message.is_streaming = false;
    }
}

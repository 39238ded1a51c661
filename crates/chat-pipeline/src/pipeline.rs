//! Send and regenerate orchestration.
//!
//! `ChatPipeline` wires the context builder, conversation store, adapter
//! registry, streaming manager and reconciler together. Each conversation runs
//! at most one send at a time; different conversations stream concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Notify};

use chat_core::conversation::DEFAULT_TITLE;
use chat_core::{
    derive_title, Conversation, ExportedConversation, Message, MessageMetadata, WorkspaceContext,
};
use chat_llm::{AdapterError, AdapterRegistry, HistoryMessage, StreamOptions};

use crate::config::{PipelineConfig, MIN_STREAM_IDLE_TIMEOUT};
use crate::context::{augment_prompt, build_workspace_prompt};
use crate::error::{PipelineError, Result, StoreError};
use crate::events::PipelineEvent;
use crate::persistence::Persistence;
use crate::reconciler::MessageReconciler;
use crate::store::ConversationStore;
use crate::stream::{consume_chunk_stream, StreamEnd};
use crate::streaming::StreamingManager;

pub const ADAPTER_NOT_FOUND_MESSAGE: &str =
    "No AI provider is configured for this conversation. Please check your settings.";
pub const STREAM_ERROR_MESSAGE: &str =
    "Sorry, I encountered an error while generating a response. Please try again.";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    AwaitingContext,
    UserMessageAppended,
    StreamOpen,
    Streaming,
    Finalized,
    Cancelled,
    Errored,
}

/// Result of a send or regeneration.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Finalized {
        conversation_id: String,
        user_message_id: String,
        message_id: String,
        metadata: MessageMetadata,
    },
    /// The response was cancelled; `message_id` holds the frozen partial content
    Cancelled {
        conversation_id: String,
        user_message_id: String,
        message_id: String,
    },
    /// `message_id` is the error message shown to the user. `partial_message_id`
    /// is set when streamed content was kept in a separate message.
    Errored {
        conversation_id: String,
        user_message_id: String,
        message_id: String,
        partial_message_id: Option<String>,
    },
}

impl SendOutcome {
    pub fn conversation_id(&self) -> &str {
        match self {
            SendOutcome::Finalized { conversation_id, .. }
            | SendOutcome::Cancelled { conversation_id, .. }
            | SendOutcome::Errored { conversation_id, .. } => conversation_id,
        }
    }

    pub fn user_message_id(&self) -> &str {
        match self {
            SendOutcome::Finalized { user_message_id, .. }
            | SendOutcome::Cancelled { user_message_id, .. }
            | SendOutcome::Errored { user_message_id, .. } => user_message_id,
        }
    }

    /// Id of the assistant message that ends the exchange.
    pub fn message_id(&self) -> &str {
        match self {
            SendOutcome::Finalized { message_id, .. }
            | SendOutcome::Cancelled { message_id, .. }
            | SendOutcome::Errored { message_id, .. } => message_id,
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        match self {
            SendOutcome::Finalized { .. } => PipelinePhase::Finalized,
            SendOutcome::Cancelled { .. } => PipelinePhase::Cancelled,
            SendOutcome::Errored { .. } => PipelinePhase::Errored,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    provider: String,
    model: Option<String>,
    context_enabled: bool,
    workspace: WorkspaceContext,
}

pub struct ChatPipeline {
    registry: Arc<AdapterRegistry>,
    store: Arc<ConversationStore>,
    streams: Arc<StreamingManager>,
    reconciler: MessageReconciler,
    settings: RwLock<Settings>,
    temperature: f32,
    max_tokens: u32,
    idle_timeout: Duration,
    phases: DashMap<String, PipelinePhase>,
    in_flight: AtomicUsize,
    settled: Notify,
    events: broadcast::Sender<PipelineEvent>,
}

impl ChatPipeline {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<ConversationStore>,
        config: PipelineConfig,
    ) -> Self {
        let streams = Arc::new(StreamingManager::new());
        let reconciler =
            MessageReconciler::new(store.clone(), streams.clone()).with_pricing(config.pricing);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            registry,
            store,
            streams,
            reconciler,
            settings: RwLock::new(Settings {
                provider: config.provider,
                model: config.model,
                context_enabled: config.context_enabled,
                workspace: WorkspaceContext::default(),
            }),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            idle_timeout: config.stream_idle_timeout.max(MIN_STREAM_IDLE_TIMEOUT),
            phases: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            settled: Notify::new(),
            events,
        }
    }

    /// Build a pipeline over conversations loaded from `persistence`.
    pub fn with_persistence(
        registry: Arc<AdapterRegistry>,
        persistence: Arc<dyn Persistence>,
        config: PipelineConfig,
    ) -> Self {
        let store = Arc::new(ConversationStore::load(persistence));
        Self::new(registry, store, config)
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn streams(&self) -> &Arc<StreamingManager> {
        &self.streams
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Receive stream progress for every conversation.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn set_model(&self, provider: impl Into<String>, model: Option<String>) {
        let mut settings = self.settings.write();
        settings.provider = provider.into();
        settings.model = model;
        tracing::info!(
            "Using provider '{}' (model: {})",
            settings.provider,
            settings.model.as_deref().unwrap_or("default")
        );
    }

    pub fn provider(&self) -> String {
        self.settings.read().provider.clone()
    }

    pub fn model(&self) -> Option<String> {
        self.settings.read().model.clone()
    }

    pub fn set_context_enabled(&self, enabled: bool) {
        self.settings.write().context_enabled = enabled;
    }

    pub fn context_enabled(&self) -> bool {
        self.settings.read().context_enabled
    }

    pub fn set_workspace_context(&self, workspace: WorkspaceContext) {
        self.settings.write().workspace = workspace;
    }

    pub fn workspace_context(&self) -> WorkspaceContext {
        self.settings.read().workspace.clone()
    }

    /// True while any send or regeneration is running.
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn phase(&self, conversation_id: &str) -> PipelinePhase {
        self.phases
            .get(conversation_id)
            .map(|phase| *phase)
            .unwrap_or(PipelinePhase::Idle)
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        self.store.active()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.store.list()
    }

    /// Create a conversation scoped to the current workspace and activate it.
    pub fn new_conversation(&self) -> Conversation {
        let context = self.settings.read().workspace.conversation_context();
        let conversation = self.store.create_conversation(DEFAULT_TITLE, context);
        if let Err(e) = self.store.set_active(&conversation.id) {
            tracing::warn!("[{}] Failed to activate conversation: {}", conversation.id, e);
        }
        self.store.persist();
        conversation
    }

    pub fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        self.store.set_active(conversation_id)?;
        self.store.persist();
        Ok(())
    }

    /// Delete a conversation, cancelling any response still streaming into it.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let conversation = self
            .store
            .get(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        for message_id in conversation.streaming_message_ids() {
            self.streams.cancel_stream(&message_id);
        }
        self.store.delete_conversation(conversation_id)?;
        self.store.persist();
        tracing::info!("[{}] Conversation deleted", conversation_id);
        Ok(())
    }

    pub fn export_active(&self) -> Result<ExportedConversation> {
        let conversation_id = self
            .store
            .active_id()
            .ok_or(PipelineError::NoActiveConversation)?;
        Ok(self.store.export(&conversation_id)?)
    }

    /// Send `text` to the active conversation, creating one if none is active.
    pub async fn send(&self, text: &str) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Err(PipelineError::EmptyMessage);
        }
        let conversation_id = match self.store.active_id() {
            Some(id) => id,
            None => self.new_conversation().id,
        };
        self.send_to(&conversation_id, text).await
    }

    /// Send `text` to a specific conversation.
    pub async fn send_to(&self, conversation_id: &str, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::EmptyMessage);
        }
        if !self.store.contains(conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()).into());
        }

        let guard = self.begin(conversation_id)?;
        let (context_prompt, message_context) = self.context_for_send();

        let mut user_message = Message::user(text);
        if let Some(context) = message_context {
            user_message = user_message.with_context(context);
        }
        let user_message_id = user_message.id.clone();
        self.store.append_message(conversation_id, user_message)?;
        self.title_from_first_message(conversation_id, text)?;
        guard.set(PipelinePhase::UserMessageAppended);
        self.store.persist();

        self.respond(&guard, conversation_id, &user_message_id, &context_prompt)
            .await
    }

    /// Replace the assistant message `message_id` with a fresh response to the
    /// user message right before it. When `message_id` is a partial response
    /// cut short by a stream error, the error message after it goes too.
    ///
    /// Returns `Ok(None)` when the message is unknown, is not an assistant
    /// message, or does not follow a user message.
    pub async fn regenerate(&self, message_id: &str) -> Result<Option<SendOutcome>> {
        let Some(conversation_id) = self.store.conversation_of(message_id) else {
            tracing::debug!("Regenerate ignored: message {} not found", message_id);
            return Ok(None);
        };

        if self.streams.cancel_stream(message_id) {
            tracing::info!("[{}] Cancelled live stream before regenerating", message_id);
        }
        let guard = self.begin_when_idle(&conversation_id).await;

        let messages = self.store.messages(&conversation_id)?;
        let Some(position) = messages.iter().position(|m| m.id == message_id) else {
            return Ok(None);
        };
        if !messages[position].is_assistant() {
            return Ok(None);
        }
        let Some(user_message) = position
            .checked_sub(1)
            .map(|i| &messages[i])
            .filter(|m| m.is_user())
        else {
            tracing::debug!("Regenerate ignored: {} does not follow a user message", message_id);
            return Ok(None);
        };
        let user_message_id = user_message.id.clone();
        // A frozen partial is followed by the error message its failure produced.
        let paired_error_id = messages
            .get(position + 1)
            .filter(|m| {
                m.is_assistant() && !m.is_streaming && m.content == STREAM_ERROR_MESSAGE
            })
            .map(|m| m.id.clone());

        let (context_prompt, _) = self.context_for_send();
        self.store.remove_message(&conversation_id, message_id)?;
        if let Some(error_id) = &paired_error_id {
            self.store.remove_message(&conversation_id, error_id)?;
        }
        self.store.persist();
        tracing::info!(
            "[{}] Regenerating response to {}",
            conversation_id,
            user_message_id
        );

        self.respond(&guard, &conversation_id, &user_message_id, &context_prompt)
            .await
            .map(Some)
    }

    /// Cancel the response streaming into `message_id`.
    pub fn cancel(&self, message_id: &str) -> bool {
        self.streams.cancel_stream(message_id)
    }

    /// Cancel every live response. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.streams.cancel_all_streams()
    }

    /// Cancel everything, refuse new streams and save state.
    pub fn shutdown(&self) {
        self.streams.close();
        self.store.persist();
        tracing::info!("Chat pipeline shut down");
    }

    fn context_for_send(&self) -> (String, Option<chat_core::MessageContext>) {
        let settings = self.settings.read();
        let prompt = build_workspace_prompt(settings.context_enabled, &settings.workspace);
        let message_context = settings
            .context_enabled
            .then(|| settings.workspace.message_context());
        (prompt, message_context)
    }

    fn title_from_first_message(&self, conversation_id: &str, text: &str) -> Result<()> {
        let Some(conversation) = self.store.get(conversation_id) else {
            return Ok(());
        };
        let user_messages = conversation.messages.iter().filter(|m| m.is_user()).count();
        if conversation.title == DEFAULT_TITLE && user_messages == 1 {
            self.store.rename(conversation_id, derive_title(text))?;
        }
        Ok(())
    }

    fn begin(&self, conversation_id: &str) -> Result<SendGuard<'_>> {
        match self.phases.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(PipelineError::ConversationBusy(
                    conversation_id.to_string(),
                ))
            }
            Entry::Vacant(entry) => {
                entry.insert(PipelinePhase::AwaitingContext);
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("[{}] {:?}", conversation_id, PipelinePhase::AwaitingContext);
        Ok(SendGuard {
            pipeline: self,
            conversation_id: conversation_id.to_string(),
        })
    }

    async fn begin_when_idle(&self, conversation_id: &str) -> SendGuard<'_> {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Ok(guard) = self.begin(conversation_id) {
                return guard;
            }
            notified.await;
        }
    }

    fn history_for(
        &self,
        conversation_id: &str,
        user_message_id: &str,
        context_prompt: &str,
    ) -> Result<Vec<HistoryMessage>> {
        let messages = self.store.messages(conversation_id)?;
        let end = messages
            .iter()
            .position(|m| m.id == user_message_id)
            .ok_or_else(|| StoreError::MessageNotFound(user_message_id.to_string()))?;

        let mut history: Vec<HistoryMessage> = messages[..end]
            .iter()
            .filter(|m| !m.is_streaming && !m.content.trim().is_empty())
            .map(HistoryMessage::from)
            .collect();
        history.push(HistoryMessage::user(augment_prompt(
            context_prompt,
            &messages[end].content,
        )));
        Ok(history)
    }

    async fn respond(
        &self,
        guard: &SendGuard<'_>,
        conversation_id: &str,
        user_message_id: &str,
        context_prompt: &str,
    ) -> Result<SendOutcome> {
        let (provider, model) = {
            let settings = self.settings.read();
            (settings.provider.clone(), settings.model.clone())
        };

        let adapter = match self.registry.get(&provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!("[{}] {}", conversation_id, e);
                let message = Message::assistant(ADAPTER_NOT_FOUND_MESSAGE);
                let message_id = message.id.clone();
                self.store
                    .insert_message_after(conversation_id, user_message_id, message)?;
                let outcome = SendOutcome::Errored {
                    conversation_id: conversation_id.to_string(),
                    user_message_id: user_message_id.to_string(),
                    message_id,
                    partial_message_id: None,
                };
                guard.set(outcome.phase());
                self.store.persist();
                self.emit_ended(&outcome);
                return Ok(outcome);
            }
        };

        let history = self.history_for(conversation_id, user_message_id, context_prompt)?;
        let display_model = model
            .clone()
            .or_else(|| adapter.default_model().map(str::to_string));
        let placeholder = Message::assistant_placeholder().with_model(provider.clone(), display_model);
        let message_id = placeholder.id.clone();
        self.store
            .insert_message_after(conversation_id, user_message_id, placeholder)?;

        let session = match self.streams.start_guarded(&message_id) {
            Ok(session) => session,
            Err(e) => {
                self.store.remove_message(conversation_id, &message_id)?;
                return Err(e.into());
            }
        };
        guard.set(PipelinePhase::StreamOpen);
        let _ = self.events.send(PipelineEvent::StreamStarted {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
        });
        tracing::info!(
            "[{}] Streaming response {} from '{}' ({} history messages)",
            conversation_id,
            message_id,
            provider,
            history.len()
        );

        let options = StreamOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            model,
        };

        let end = tokio::select! {
            biased;
            _ = session.cancelled() => StreamEnd::Cancelled,
            opened = tokio::time::timeout(self.idle_timeout, adapter.stream_chat(&history, &options)) => {
                match opened {
                    Ok(Ok(stream)) => {
                        guard.set(PipelinePhase::Streaming);
                        consume_chunk_stream(
                            stream,
                            &self.reconciler,
                            &self.events,
                            session.handle(),
                            conversation_id,
                            &message_id,
                            self.idle_timeout,
                        )
                        .await?
                    }
                    Ok(Err(e)) => StreamEnd::Failed(e),
                    Err(_) => StreamEnd::Failed(AdapterError::IdleTimeout(self.idle_timeout)),
                }
            }
        };

        let cancelled = || SendOutcome::Cancelled {
            conversation_id: conversation_id.to_string(),
            user_message_id: user_message_id.to_string(),
            message_id: message_id.clone(),
        };

        let outcome = match end {
            StreamEnd::Finalized(metadata) => SendOutcome::Finalized {
                conversation_id: conversation_id.to_string(),
                user_message_id: user_message_id.to_string(),
                message_id: message_id.clone(),
                metadata,
            },
            StreamEnd::Exhausted => {
                tracing::warn!(
                    "[{}] Stream for {} ended without a finish reason; finalizing",
                    conversation_id,
                    message_id
                );
                match self
                    .reconciler
                    .finalize(conversation_id, &message_id, session.handle())?
                {
                    Some(metadata) => SendOutcome::Finalized {
                        conversation_id: conversation_id.to_string(),
                        user_message_id: user_message_id.to_string(),
                        message_id: message_id.clone(),
                        metadata,
                    },
                    None => {
                        self.freeze_quietly(conversation_id, &message_id);
                        cancelled()
                    }
                }
            }
            StreamEnd::Failed(_) if session.is_cancelled() => {
                self.freeze_quietly(conversation_id, &message_id);
                cancelled()
            }
            StreamEnd::Cancelled => {
                self.freeze_quietly(conversation_id, &message_id);
                cancelled()
            }
            StreamEnd::Failed(error) => {
                self.record_failure(conversation_id, user_message_id, &message_id, &error)?
            }
        };

        drop(session);
        guard.set(outcome.phase());
        self.store.persist();
        self.emit_ended(&outcome);
        Ok(outcome)
    }

    fn emit_ended(&self, outcome: &SendOutcome) {
        let _ = self.events.send(PipelineEvent::StreamEnded {
            conversation_id: outcome.conversation_id().to_string(),
            message_id: outcome.message_id().to_string(),
            phase: outcome.phase(),
        });
    }

    fn record_failure(
        &self,
        conversation_id: &str,
        user_message_id: &str,
        message_id: &str,
        error: &AdapterError,
    ) -> Result<SendOutcome> {
        tracing::error!(
            "[{}] Response {} failed: {}",
            conversation_id,
            message_id,
            error
        );

        let has_partial = self
            .store
            .message(conversation_id, message_id)
            .is_some_and(|m| !m.content.is_empty());

        if has_partial {
            self.reconciler.freeze(conversation_id, message_id)?;
            let error_message = Message::assistant(STREAM_ERROR_MESSAGE);
            let error_message_id = error_message.id.clone();
            self.store
                .insert_message_after(conversation_id, message_id, error_message)?;
            Ok(SendOutcome::Errored {
                conversation_id: conversation_id.to_string(),
                user_message_id: user_message_id.to_string(),
                message_id: error_message_id,
                partial_message_id: Some(message_id.to_string()),
            })
        } else {
            self.store
                .update_message_by_id(conversation_id, message_id, |m| {
                    m.content = STREAM_ERROR_MESSAGE.to_string();
                    m.is_streaming = false;
                })?;
            Ok(SendOutcome::Errored {
                conversation_id: conversation_id.to_string(),
                user_message_id: user_message_id.to_string(),
                message_id: message_id.to_string(),
                partial_message_id: None,
            })
        }
    }

    // The conversation may have been deleted while the stream was cancelled.
    fn freeze_quietly(&self, conversation_id: &str, message_id: &str) {
        if let Err(e) = self.reconciler.freeze(conversation_id, message_id) {
            tracing::debug!("[{}] Nothing to freeze for {}: {}", conversation_id, message_id, e);
        }
    }
}

/// Marks a conversation busy for the duration of one send.
struct SendGuard<'a> {
    pipeline: &'a ChatPipeline,
    conversation_id: String,
}

impl SendGuard<'_> {
    fn set(&self, phase: PipelinePhase) {
        if let Some(mut current) = self.pipeline.phases.get_mut(&self.conversation_id) {
            *current = phase;
        }
        tracing::debug!("[{}] {:?}", self.conversation_id, phase);
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.phases.remove(&self.conversation_id);
        self.pipeline.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.pipeline.settled.notify_waiters();
        tracing::debug!("[{}] {:?}", self.conversation_id, PipelinePhase::Idle);
    }
}

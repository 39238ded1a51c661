use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message id already in use: {0}")]
    DuplicateMessageId(String),

    #[error("Failed to serialize conversation: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Message {0} already has a live stream session")]
    AlreadyStreaming(String),

    #[error("Streaming manager is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("Conversation {0} already has a response in progress")]
    ConversationBusy(String),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

//! chat_core - Core types for the workspace chat pipeline
//!
//! This crate provides the foundational types shared by the adapter layer,
//! the streaming pipeline and the CLI:
//! - `message` - Message, Role and the per-message context/metadata
//! - `conversation` - Conversation, its context and the export format
//! - `workspace` - Project and workspace inputs used to build context prompts
//! - `config` / `paths` - On-disk configuration and data locations

pub mod config;
pub mod conversation;
pub mod message;
pub mod paths;
pub mod workspace;

// Re-export commonly used types
pub use config::{Config, OpenAIConfig, ProviderConfigs};
pub use conversation::{derive_title, Conversation, ConversationContext, ExportedConversation};
pub use message::{Message, MessageContext, MessageMetadata, Role};
pub use workspace::{ProjectRef, WorkspaceContext};

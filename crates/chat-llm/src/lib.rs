pub mod adapter;
pub mod provider_factory;
pub mod providers;
pub mod registry;
pub mod types;

pub use adapter::{AdapterError, ChatAdapter, ChunkStream};
pub use provider_factory::{build_registry, AVAILABLE_PROVIDERS};
pub use providers::{EchoAdapter, OpenAIAdapter, RecordedCall, ScriptStep, ScriptedAdapter};
pub use registry::{AdapterRegistry, RegistryError};
pub use types::{ChatChunk, HistoryMessage, StreamOptions};

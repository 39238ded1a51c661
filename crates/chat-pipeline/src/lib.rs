pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod persistence;
pub mod pipeline;
pub mod reconciler;
pub mod store;
pub mod stream;
pub mod streaming;

pub use config::PipelineConfig;
pub use context::{augment_prompt, build_context_prompt, build_workspace_prompt};
pub use error::{PersistenceError, PipelineError, StoreError, StreamError};
pub use events::PipelineEvent;
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use pipeline::{
    ChatPipeline, PipelinePhase, SendOutcome, ADAPTER_NOT_FOUND_MESSAGE, STREAM_ERROR_MESSAGE,
};
pub use reconciler::{ChunkOutcome, MessageReconciler};
pub use store::ConversationStore;
pub use streaming::{SessionGuard, SessionHandle, StreamSession, StreamingManager};

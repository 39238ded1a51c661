use crate::pipeline::PipelinePhase;

/// Progress notifications broadcast while responses stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StreamStarted {
        conversation_id: String,
        message_id: String,
    },
    /// Content appended to a streaming message
    Chunk {
        conversation_id: String,
        message_id: String,
        content: String,
    },
    /// `phase` is the terminal phase of the exchange
    StreamEnded {
        conversation_id: String,
        message_id: String,
        phase: PipelinePhase,
    },
}

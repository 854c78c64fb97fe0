use crate::ids::{ContextId, SampleId};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum WaldoError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("invalid payload for {event_type}: {message}")]
    InvalidPayload { event_type: String, message: String },
    #[error("storage timeout: {0}")]
    StorageTimeout(String),
    #[error("unknown sample: {0}")]
    UnknownSample(SampleId),
    #[error("unknown context: {0}")]
    UnknownContext(ContextId),
    #[error("invalid score for sample {sample_id}: {score} is not finite")]
    InvalidScore { sample_id: SampleId, score: f64 },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl WaldoError {
    /// Whether repeating the whole write from normalization can succeed.
    ///
    /// Only lock timeouts qualify: every write step is either atomic or an
    /// insert-if-absent, so a replay never duplicates rows.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageTimeout(_))
    }
}

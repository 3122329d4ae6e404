use std::time::Duration;

use tether_conversation::ConversationError;
use tether_core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Run timed out after {after:?}")]
    RunTimeout { after: Duration },

    #[error("LLM error: {0}")]
    Llm(#[from] anyhow::Error),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Failed to record event: {0}")]
    Record(String),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// Stable tag recorded on failed turns and sent in `error` events.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::RunTimeout { .. } => "run_timeout",
            Self::Llm(_) => "llm_error",
            Self::Cancelled => "cancelled",
            Self::Record(_) => "record_failed",
            Self::Conversation(_) => "conversation_error",
            Self::Store(_) => "store_unavailable",
        }
    }
}

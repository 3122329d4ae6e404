use tether_core::{IndexingStatus, StoreError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConversationError>;

/// Errors that can occur while recording conversation state.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Turn {0} was not started or has already ended")]
    UnpairedTurn(String),

    #[error("Request {0} was not started or has already completed")]
    UnpairedRequest(String),

    #[error("Invalid indexing transition: {from} -> {to}")]
    InvalidTransition {
        from: IndexingStatus,
        to: IndexingStatus,
    },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Conversation is closed: {0}")]
    ConversationClosed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

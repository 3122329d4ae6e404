use tether_core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Malformed checkpoint key `{key}`: {reason}")]
    MalformedKey { key: String, reason: String },

    #[error("Failed to deserialize checkpoint `{key}`: {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tether_core::keys::{escape_segment, join_segments, split_segments};

use crate::error::CheckpointError;

/// Leading segment of every checkpoint key.
pub const CHECKPOINT_NAMESPACE: &str = "checkpoint";

/// The four-part identifier of a checkpoint, minus the fixed namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointKey {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
}

impl CheckpointKey {
    #[must_use]
    pub fn new(
        thread_id: impl Into<String>,
        checkpoint_ns: impl Into<String>,
        checkpoint_id: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: checkpoint_ns.into(),
            checkpoint_id: checkpoint_id.into(),
        }
    }

    /// Encode as `checkpoint:{thread}:{ns}:{id}` with escaped segments.
    #[must_use]
    pub fn format(&self) -> String {
        join_segments(&[
            CHECKPOINT_NAMESPACE,
            self.thread_id.as_str(),
            self.checkpoint_ns.as_str(),
            self.checkpoint_id.as_str(),
        ])
    }

    /// Decode a key produced by [`CheckpointKey::format`].
    pub fn parse(key: &str) -> Result<Self, CheckpointError> {
        let malformed = |reason: String| CheckpointError::MalformedKey {
            key: key.to_string(),
            reason,
        };

        let segments = split_segments(key).map_err(|e| malformed(e.to_string()))?;
        let [namespace, thread_id, checkpoint_ns, checkpoint_id]: [String; 4] =
            segments.try_into().map_err(|segments: Vec<String>| {
                malformed(format!("expected 4 segments, found {}", segments.len()))
            })?;

        if namespace != CHECKPOINT_NAMESPACE {
            return Err(malformed(format!(
                "expected `{CHECKPOINT_NAMESPACE}` namespace, found `{namespace}`"
            )));
        }

        Ok(Self {
            thread_id,
            checkpoint_ns,
            checkpoint_id,
        })
    }

    /// Scan prefix covering every checkpoint of `thread_id`.
    #[must_use]
    pub fn thread_prefix(thread_id: &str) -> String {
        format!("{CHECKPOINT_NAMESPACE}:{}:", escape_segment(thread_id))
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for CheckpointKey {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

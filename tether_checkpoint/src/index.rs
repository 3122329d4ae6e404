use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_core::{ChatMessage, KvStore};
use tracing::{debug, warn};

use crate::error::Result;
use crate::saver::CheckpointSaver;

/// The earliest checkpoint a message appeared in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
}

/// Resume coordinates attached to a history state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
}

/// One step of a thread's history as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryState {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointConfig>,
}

impl HistoryState {
    #[must_use]
    pub const fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            checkpoint: None,
        }
    }
}

/// Maps message ids to the oldest checkpoint that contains them.
#[derive(Clone)]
pub struct CheckpointIndex {
    saver: CheckpointSaver,
}

impl CheckpointIndex {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            saver: CheckpointSaver::new(store),
        }
    }

    /// Build `message id -> earliest checkpoint` for `thread_id`.
    ///
    /// Unreadable checkpoints are skipped. Store failures propagate.
    pub async fn build(&self, thread_id: &str) -> Result<HashMap<String, CheckpointRef>> {
        let mut checkpoints = self.saver.list(thread_id).await?;
        // Stable sort: equal timestamps keep key order.
        checkpoints.sort_by(|a, b| a.checkpoint.ts.cmp(&b.checkpoint.ts));

        let mut index = HashMap::new();
        for stored in &checkpoints {
            for message_id in stored.checkpoint.message_ids() {
                index
                    .entry(message_id.to_string())
                    .or_insert_with(|| CheckpointRef {
                        checkpoint_ns: stored.key.checkpoint_ns.clone(),
                        checkpoint_id: stored.key.checkpoint_id.clone(),
                        parent_checkpoint_id: stored.checkpoint.parent_checkpoint_id.clone(),
                    });
            }
        }

        debug!(
            "Indexed {} messages across {} checkpoints for thread {}",
            index.len(),
            checkpoints.len(),
            thread_id
        );
        Ok(index)
    }

    /// Attach checkpoint coordinates to each state. Best effort: if the index
    /// cannot be built the states come back unannotated.
    pub async fn annotate(&self, thread_id: &str, states: Vec<HistoryState>) -> Vec<HistoryState> {
        match self.build(thread_id).await {
            Ok(index) => annotate_states(thread_id, &index, states),
            Err(e) => {
                warn!("Checkpoint index unavailable for thread {thread_id}: {e}");
                states
            }
        }
    }
}

/// Annotate states from a prebuilt index. States whose last message is unknown are left as is.
#[must_use]
pub fn annotate_states<S: std::hash::BuildHasher>(
    thread_id: &str,
    index: &HashMap<String, CheckpointRef, S>,
    states: Vec<HistoryState>,
) -> Vec<HistoryState> {
    states
        .into_iter()
        .map(|mut state| {
            let found = state
                .messages
                .last()
                .and_then(|m| m.id.as_deref())
                .and_then(|id| index.get(id));
            if let Some(found) = found {
                state.checkpoint = Some(CheckpointConfig {
                    thread_id: thread_id.to_string(),
                    checkpoint_ns: found.checkpoint_ns.clone(),
                    checkpoint_id: found.checkpoint_id.clone(),
                    parent_checkpoint_id: found.parent_checkpoint_id.clone(),
                });
            }
            state
        })
        .collect()
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{ChatMessage, KvStore};
use tracing::{debug, warn};

use crate::codec::CheckpointKey;
use crate::error::{CheckpointError, Result};

/// A persisted snapshot of a thread's state at one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
    /// Messages in the thread state, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Checkpoint {
    #[must_use]
    pub fn new(id: impl Into<String>, ts: DateTime<Utc>, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: id.into(),
            ts,
            parent_checkpoint_id: None,
            messages,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_checkpoint_id: impl Into<String>) -> Self {
        self.parent_checkpoint_id = Some(parent_checkpoint_id.into());
        self
    }

    /// Ids of the messages in this checkpoint, in state order. Id-less messages are skipped.
    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().filter_map(|m| m.id.as_deref())
    }
}

/// A checkpoint together with the key it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    pub key: CheckpointKey,
    pub checkpoint: Checkpoint,
}

/// Reads and writes checkpoints through a [`KvStore`].
#[derive(Clone)]
pub struct CheckpointSaver {
    store: Arc<dyn KvStore>,
}

impl CheckpointSaver {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn put(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint: &Checkpoint,
    ) -> Result<CheckpointKey> {
        let key = CheckpointKey::new(thread_id, checkpoint_ns, checkpoint.id.clone());
        let payload = serde_json::to_string(checkpoint)?;
        self.store.put(&key.format(), &payload).await?;
        debug!("Saved checkpoint {} for thread {}", checkpoint.id, thread_id);
        Ok(key)
    }

    pub async fn get(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        let raw_key = key.format();
        let Some(payload) = self.store.get(&raw_key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|source| CheckpointError::Deserialization {
                key: raw_key,
                source,
            })
    }

    /// Every readable checkpoint of `thread_id`, in key order.
    ///
    /// Keys that fail to parse, belong to another thread, or hold unreadable
    /// payloads are logged and skipped. Store failures propagate.
    pub async fn list(&self, thread_id: &str) -> Result<Vec<StoredCheckpoint>> {
        let keys = self
            .store
            .list_prefix(&CheckpointKey::thread_prefix(thread_id))
            .await?;

        let mut checkpoints = Vec::with_capacity(keys.len());
        for raw_key in keys {
            let key = match CheckpointKey::parse(&raw_key) {
                Ok(key) if key.thread_id == thread_id => key,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping checkpoint key: {e}");
                    continue;
                }
            };

            match self.get(&key).await {
                Ok(Some(checkpoint)) => checkpoints.push(StoredCheckpoint { key, checkpoint }),
                Ok(None) => debug!("Checkpoint {raw_key} vanished during scan"),
                Err(CheckpointError::Store(e)) => return Err(CheckpointError::Store(e)),
                Err(e) => warn!("Skipping checkpoint: {e}"),
            }
        }

        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tether_core::MemoryKvStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[tokio::test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    async fn test_put_get_list() {
        let store = Arc::new(MemoryKvStore::new());
        let saver = CheckpointSaver::new(store.clone());

        let first = Checkpoint::new("c1", at(10), vec![ChatMessage::user("hi").with_id("m1")]);
        let second = Checkpoint::new("c2", at(20), vec![]).with_parent("c1");

        let key = saver.put("t1", "", &first).await.expect("put failed");
        saver.put("t1", "", &second).await.expect("put failed");
        saver.put("t2", "", &first).await.expect("put failed");

        let loaded = saver.get(&key).await.expect("get failed");
        assert_eq!(loaded.as_ref(), Some(&first));

        let listed = saver.list("t1").await.expect("list failed");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|c| c.key.thread_id == "t1"));
        assert_eq!(listed[1].checkpoint.parent_checkpoint_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    async fn test_list_skips_corrupt_payloads() {
        let store = Arc::new(MemoryKvStore::new());
        let saver = CheckpointSaver::new(store.clone());

        saver
            .put("t1", "", &Checkpoint::new("ok", at(1), vec![]))
            .await
            .expect("put failed");
        store
            .put("checkpoint:t1::broken", "{not json")
            .await
            .expect("put failed");

        let listed = saver.list("t1").await.expect("list failed");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checkpoint.id, "ok");

        let broken = saver
            .get(&CheckpointKey::new("t1", "", "broken"))
            .await;
        assert!(matches!(broken, Err(CheckpointError::Deserialization { .. })));
    }

    #[test]
    fn test_message_ids_skip_idless() {
        let checkpoint = Checkpoint::new(
            "c1",
            at(0),
            vec![
                ChatMessage::user("a").with_id("m1"),
                ChatMessage::assistant("b"),
                ChatMessage::user("c").with_id("m3"),
            ],
        );
        assert_eq!(checkpoint.message_ids().collect::<Vec<_>>(), vec!["m1", "m3"]);
    }
}

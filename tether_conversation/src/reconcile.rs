//! Merges persisted history with freshly submitted messages.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tether_core::{ChatMessage, MessageRecord, Role, message_fingerprint};
use tracing::debug;

use crate::error::Result;
use crate::store::ConversationStore;

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Re-admit system records tagged with `traceType`.
    pub include_trace_records: bool,
    /// How many trailing emitted entries a repeat is compared against.
    pub dedup_window: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            include_trace_records: false,
            dedup_window: 1,
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub const fn with_trace_records(mut self, include: bool) -> Self {
        self.include_trace_records = include;
        self
    }

    #[must_use]
    pub const fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }
}

/// One message on the merged timeline. `timestamp` is epoch microseconds,
/// `None` when the record carries no usable time.
#[derive(Debug)]
struct TimelineEntry {
    message: ChatMessage,
    timestamp: Option<i64>,
    role_rank: u8,
    sequence: usize,
}

/// Total order over timeline entries: finite timestamps first and ascending,
/// then role rank, then sequence.
fn compare(a: &TimelineEntry, b: &TimelineEntry) -> Ordering {
    match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) if x != y => x.cmp(&y),
        (Some(_), Some(_)) => a
            .role_rank
            .cmp(&b.role_rank)
            .then(a.sequence.cmp(&b.sequence)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.sequence.cmp(&b.sequence),
    }
}

fn index_timestamp(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

/// Builds the single ordered timeline a new turn runs against.
#[derive(Debug, Clone, Default)]
pub struct MessageReconciler {
    config: ReconcileConfig,
}

impl MessageReconciler {
    #[must_use]
    pub const fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    fn admits(&self, record: &MessageRecord) -> bool {
        record.role != Role::System
            || (self.config.include_trace_records && record.trace_type().is_some())
    }

    /// Merge `history` with `incoming` into one deduplicated timeline.
    ///
    /// Stale system prompts never re-enter the timeline. Incoming messages
    /// always land after every history entry.
    #[must_use]
    pub fn merge(&self, history: &[MessageRecord], incoming: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if history.is_empty() {
            return incoming;
        }

        let mut entries: Vec<TimelineEntry> = history
            .iter()
            .enumerate()
            .filter(|(_, record)| self.admits(record))
            .map(|(sequence, record)| TimelineEntry {
                message: record.to_message(),
                timestamp: record.created_at_micros(),
                role_rank: record.role.rank(),
                sequence,
            })
            .collect();

        if entries.iter().all(|e| e.timestamp.is_none()) {
            for entry in &mut entries {
                entry.timestamp = Some(index_timestamp(entry.sequence));
            }
        }

        let base = entries
            .iter()
            .filter_map(|e| e.timestamp)
            .max()
            .map_or_else(|| index_timestamp(history.len()), |max| max.saturating_add(1));

        entries.extend(incoming.into_iter().enumerate().map(|(offset, message)| {
            TimelineEntry {
                timestamp: Some(base.saturating_add(index_timestamp(offset))),
                role_rank: message.role.rank(),
                sequence: history.len() + offset,
                message,
            }
        }));

        entries.sort_by(compare);
        self.dedup(entries)
    }

    /// Drop exact repeats: an id already emitted, or a fingerprint equal to
    /// one of the last `dedup_window` emitted entries without distinct ids.
    fn dedup(&self, entries: Vec<TimelineEntry>) -> Vec<ChatMessage> {
        let mut emitted = Vec::with_capacity(entries.len());
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut recent: VecDeque<(Option<String>, String)> =
            VecDeque::with_capacity(self.config.dedup_window);

        for entry in entries {
            let message = entry.message;
            if message.id.as_ref().is_some_and(|id| seen_ids.contains(id)) {
                debug!("Dropping repeated message id {:?}", message.id);
                continue;
            }

            let fingerprint = message_fingerprint(&message);
            let repeat = recent.iter().any(|(prev_id, prev_fingerprint)| {
                let distinct_ids = matches!(
                    (prev_id, &message.id),
                    (Some(a), Some(b)) if a != b
                );
                *prev_fingerprint == fingerprint && !distinct_ids
            });
            if repeat {
                debug!("Dropping retried {} message", message.role);
                continue;
            }

            if let Some(id) = &message.id {
                seen_ids.insert(id.clone());
            }
            if self.config.dedup_window > 0 {
                if recent.len() == self.config.dedup_window {
                    recent.pop_front();
                }
                recent.push_back((message.id.clone(), fingerprint));
            }
            emitted.push(message);
        }

        emitted
    }

    /// Read the conversation's history and merge `incoming` onto it.
    ///
    /// Store failures propagate.
    pub async fn hydrate(
        &self,
        store: &ConversationStore,
        conversation_id: &str,
        incoming: Vec<ChatMessage>,
    ) -> Result<Vec<ChatMessage>> {
        let history = store.history(conversation_id).await?;
        let merged = self.merge(&history, incoming);
        debug!(
            "Hydrated conversation {}: {} stored, {} in timeline",
            conversation_id,
            history.len(),
            merged.len()
        );
        Ok(merged)
    }
}

//! Lifecycle authority for conversations, requests, turns and messages.
//!
//! Every entity lives in the shared [`KvStore`] under its own key:
//!
//! - `conversation:{id}`, `request:{id}`, `turn:{id}`
//! - `message:{conversation}:{slot}` where `slot` is a fresh `UUIDv7`, so a
//!   prefix scan returns messages in write order
//! - `trace:{conversation}:{slot}` for LLM and tool call trace events

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_core::keys::{escape_segment, join_segments};
use tether_core::{
    ChatMessage, Conversation, ConversationStatus, EventRecorder, IndexingStatus, KvStore,
    MessageRecord, Request, Role, RunEvent, TraceContext, Turn, TurnOutcome, TurnStatus, Usage,
    message_fingerprint,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConversationError, Result};

/// `traceType` tag of the system records written for completed LLM calls.
pub const LLM_CALL_TRACE_TYPE: &str = "llm_call";

fn conversation_key(id: &str) -> String {
    join_segments(&["conversation", id])
}

fn request_key(id: &str) -> String {
    join_segments(&["request", id])
}

fn turn_key(id: &str) -> String {
    join_segments(&["turn", id])
}

fn message_prefix(conversation_id: &str) -> String {
    format!("message:{}:", escape_segment(conversation_id))
}

fn trace_prefix(conversation_id: &str) -> String {
    format!("trace:{}:", escape_segment(conversation_id))
}

fn slot_key(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::now_v7())
}

/// A recorded LLM or tool call event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub turn_id: String,
    pub recorded_at: DateTime<Utc>,
    pub event: RunEvent,
}

/// System record that mirrors a completed LLM call into the message history.
fn llm_call_record(
    ctx: &TraceContext,
    call_id: &str,
    usage: Option<Usage>,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> MessageRecord {
    let content = error.map_or_else(
        || format!("llm call {call_id} completed"),
        |e| format!("llm call {call_id} failed: {e}"),
    );
    let mut record = MessageRecord::from_message_at(
        &ctx.conversation_id,
        &ChatMessage::new(Role::System, content),
        at,
    );
    record.metadata = Some(serde_json::json!({
        "traceType": LLM_CALL_TRACE_TYPE,
        "callId": call_id,
        "turnId": ctx.turn_id,
        "requestId": ctx.request_id,
        "usage": usage,
        "error": error,
    }));
    record
}

/// Owns the mutation path for every conversation entity.
///
/// Mutations against one conversation id are serialized through a
/// per-conversation async mutex. Reads do not take the lock. Message records
/// are stamped from a clock that never repeats, so records written in one
/// batch keep their write order on the next merge.
pub struct ConversationStore {
    store: Arc<dyn KvStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl ConversationStore {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            last_stamp: Mutex::new(None),
        }
    }

    /// The underlying key/value store.
    #[must_use]
    pub const fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Take the conversation's mutex. Entries nobody holds or waits on are
    /// dropped from the table on the way.
    async fn lock(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            let lock = locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            lock
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Current time at microsecond precision, strictly after every earlier stamp.
    async fn next_stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock().await;
        let now = Utc::now().trunc_subsecs(6);
        let stamp = match *last {
            Some(previous) if now <= previous => previous + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn write<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.put(key, &raw).await?;
        Ok(())
    }

    /// Read every record under `prefix`, skipping unreadable payloads.
    async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let keys = self.store.list_prefix(prefix).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {key}: {e}"),
            }
        }
        Ok(records)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.read(&conversation_key(id)).await
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        self.read(&request_key(id)).await
    }

    pub async fn get_turn(&self, id: &str) -> Result<Option<Turn>> {
        self.read(&turn_key(id)).await
    }

    async fn load_conversation(&self, id: &str) -> Result<Conversation> {
        self.get_conversation(id)
            .await?
            .ok_or_else(|| ConversationError::ConversationNotFound(id.to_string()))
    }

    async fn touch_locked(&self, id: &str) -> Result<()> {
        if let Some(mut conversation) = self.get_conversation(id).await? {
            conversation.touch();
            self.write(&conversation_key(id), &conversation).await?;
        }
        Ok(())
    }

    /// Open a request, creating the conversation when `conversation_id` is
    /// absent or unknown.
    pub async fn start_request(
        &self,
        conversation_id: Option<&str>,
        owner_id: &str,
        model: &str,
    ) -> Result<Request> {
        let conversation_id =
            conversation_id.map_or_else(|| Uuid::now_v7().to_string(), ToString::to_string);
        let _guard = self.lock(&conversation_id).await;

        let existing = self.get_conversation(&conversation_id).await?;
        let mut conversation = match existing {
            Some(c) if c.status == ConversationStatus::Closed => {
                return Err(ConversationError::ConversationClosed(conversation_id));
            }
            Some(c) => c,
            None => {
                info!("Creating conversation {} for {}", conversation_id, owner_id);
                Conversation::new(&conversation_id, owner_id)
            }
        };
        conversation.touch();
        self.write(&conversation_key(&conversation_id), &conversation)
            .await?;

        let request = Request {
            id: Uuid::now_v7().to_string(),
            conversation_id,
            model: model.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            latency_ms: None,
        };
        self.write(&request_key(&request.id), &request).await?;

        info!(
            "Started request {} on conversation {}",
            request.id, request.conversation_id
        );
        Ok(request)
    }

    pub async fn complete_request(&self, request_id: &str) -> Result<Request> {
        let request = self
            .get_request(request_id)
            .await?
            .ok_or_else(|| ConversationError::RequestNotFound(request_id.to_string()))?;
        let _guard = self.lock(&request.conversation_id).await;

        // Re-read under the lock; a concurrent completion may have won.
        let mut request: Request = self
            .read(&request_key(request_id))
            .await?
            .ok_or_else(|| ConversationError::RequestNotFound(request_id.to_string()))?;
        if request.completed_at.is_some() {
            return Err(ConversationError::UnpairedRequest(request_id.to_string()));
        }

        let now = Utc::now();
        request.latency_ms = Some((now - request.started_at).num_milliseconds());
        request.completed_at = Some(now);
        self.write(&request_key(request_id), &request).await?;
        self.touch_locked(&request.conversation_id).await?;

        info!(
            "Completed request {} in {}ms",
            request.id,
            request.latency_ms.unwrap_or_default()
        );
        Ok(request)
    }

    pub async fn start_turn(
        &self,
        conversation_id: &str,
        request_id: &str,
        model: &str,
    ) -> Result<Turn> {
        let _guard = self.lock(conversation_id).await;
        let mut conversation = self.load_conversation(conversation_id).await?;

        let turn = Turn {
            id: Uuid::now_v7().to_string(),
            conversation_id: conversation_id.to_string(),
            request_id: request_id.to_string(),
            model: model.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: TurnStatus::Running,
            latency_ms: None,
            error_type: None,
        };
        self.write(&turn_key(&turn.id), &turn).await?;

        conversation.touch();
        self.write(&conversation_key(conversation_id), &conversation)
            .await?;

        info!("Started turn {} on conversation {}", turn.id, conversation_id);
        Ok(turn)
    }

    /// Close a running turn. Unknown or already ended turns are `UnpairedTurn`.
    pub async fn end_turn(&self, turn_id: &str, outcome: TurnOutcome) -> Result<Turn> {
        let turn = self
            .get_turn(turn_id)
            .await?
            .ok_or_else(|| ConversationError::UnpairedTurn(turn_id.to_string()))?;
        let _guard = self.lock(&turn.conversation_id).await;

        let mut turn: Turn = self
            .read(&turn_key(turn_id))
            .await?
            .ok_or_else(|| ConversationError::UnpairedTurn(turn_id.to_string()))?;
        if turn.status != TurnStatus::Running {
            return Err(ConversationError::UnpairedTurn(turn_id.to_string()));
        }

        let now = Utc::now();
        turn.ended_at = Some(now);
        turn.latency_ms = Some((now - turn.started_at).num_milliseconds());
        match outcome {
            TurnOutcome::Ok => turn.status = TurnStatus::Ok,
            TurnOutcome::Error { error_type } => {
                turn.status = TurnStatus::Error;
                turn.error_type = Some(error_type);
            }
        }
        self.write(&turn_key(turn_id), &turn).await?;
        self.touch_locked(&turn.conversation_id).await?;

        info!(
            "Ended turn {} with status {:?}{}",
            turn.id,
            turn.status,
            turn.error_type
                .as_deref()
                .map(|t| format!(" ({t})"))
                .unwrap_or_default()
        );
        Ok(turn)
    }

    async fn append_message_locked(
        &self,
        conversation_id: &str,
        record: &MessageRecord,
    ) -> Result<()> {
        self.write(&slot_key(&message_prefix(conversation_id)), record)
            .await?;
        debug!(
            "Recorded {} message {} in conversation {}",
            record.role, record.id, conversation_id
        );
        Ok(())
    }

    /// Persist one message. The record keeps the message id when it has one.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
    ) -> Result<MessageRecord> {
        let _guard = self.lock(conversation_id).await;
        let at = self.next_stamp().await;
        let record = MessageRecord::from_message_at(conversation_id, message, at);
        self.append_message_locked(conversation_id, &record).await?;
        Ok(record)
    }

    async fn append_trace_locked(&self, ctx: &TraceContext, event: &RunEvent) -> Result<()> {
        let record = TraceRecord {
            id: Uuid::now_v7().to_string(),
            conversation_id: ctx.conversation_id.clone(),
            request_id: ctx.request_id.clone(),
            turn_id: ctx.turn_id.clone(),
            recorded_at: Utc::now(),
            event: event.clone(),
        };
        self.write(&slot_key(&trace_prefix(&ctx.conversation_id)), &record)
            .await?;
        debug!("Recorded {} trace for turn {}", event.kind(), ctx.turn_id);
        Ok(())
    }

    /// Persist the durable part of a run event.
    ///
    /// Call and error events become trace records. A completed LLM call is
    /// also mirrored as a system record tagged with `traceType`. Messages
    /// become message records. Deltas and the sentinel are not persisted.
    pub async fn record_event(&self, ctx: &TraceContext, event: &RunEvent) -> Result<()> {
        match event {
            RunEvent::Delta { .. } | RunEvent::Done => Ok(()),
            RunEvent::Message { message } => self
                .append_message(&ctx.conversation_id, message)
                .await
                .map(|_| ()),
            RunEvent::LlmCallComplete {
                call_id,
                usage,
                error,
            } => {
                let _guard = self.lock(&ctx.conversation_id).await;
                self.append_trace_locked(ctx, event).await?;
                let at = self.next_stamp().await;
                let record = llm_call_record(ctx, call_id, *usage, error.as_deref(), at);
                self.append_message_locked(&ctx.conversation_id, &record)
                    .await
            }
            RunEvent::LlmCall { .. }
            | RunEvent::ToolCall { .. }
            | RunEvent::ToolCallComplete { .. }
            | RunEvent::Error { .. } => {
                let _guard = self.lock(&ctx.conversation_id).await;
                self.append_trace_locked(ctx, event).await
            }
        }
    }

    /// Every readable message record of a conversation, in write order.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        self.scan(&message_prefix(conversation_id)).await
    }

    /// Every readable trace record of a conversation, in write order.
    pub async fn traces(&self, conversation_id: &str) -> Result<Vec<TraceRecord>> {
        self.scan(&trace_prefix(conversation_id)).await
    }

    /// Write messages not yet present in the conversation.
    ///
    /// Messages with a known id are skipped. An id-less message is skipped
    /// when the non-trace record at the same position has the same fingerprint.
    pub async fn sync_messages(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<MessageRecord>> {
        let _guard = self.lock(conversation_id).await;
        let existing: Vec<MessageRecord> = self
            .history(conversation_id)
            .await?
            .into_iter()
            .filter(|r| r.trace_type().is_none())
            .collect();
        let mut known: HashSet<String> =
            existing.iter().map(|r| r.id.clone()).collect();

        let mut written = Vec::new();
        for (position, message) in messages.iter().enumerate() {
            let present = match &message.id {
                Some(id) => known.contains(id),
                None => existing.get(position).is_some_and(|r| {
                    message_fingerprint(&r.to_message()) == message_fingerprint(message)
                }),
            };
            if present {
                continue;
            }

            let record =
                MessageRecord::from_message_at(conversation_id, message, self.next_stamp().await);
            self.append_message_locked(conversation_id, &record).await?;
            known.insert(record.id.clone());
            written.push(record);
        }

        if !written.is_empty() {
            info!(
                "Synced {} new messages into conversation {}",
                written.len(),
                conversation_id
            );
        }
        Ok(written)
    }

    pub async fn close_conversation(&self, id: &str) -> Result<Conversation> {
        let _guard = self.lock(id).await;
        let mut conversation = self.load_conversation(id).await?;
        conversation.status = ConversationStatus::Closed;
        conversation.touch();
        self.write(&conversation_key(id), &conversation).await?;
        info!("Closed conversation {}", id);
        Ok(conversation)
    }

    /// Move the indexing state machine. Illegal moves, including same-state
    /// moves, are `InvalidTransition`. Cancellation goes through
    /// [`ConversationStore::cancel_indexing`].
    pub async fn set_indexing_status(
        &self,
        id: &str,
        next: IndexingStatus,
    ) -> Result<Conversation> {
        let _guard = self.lock(id).await;
        let mut conversation = self.load_conversation(id).await?;
        let from = conversation.indexing_status;
        if !from.can_transition_to(next) {
            return Err(ConversationError::InvalidTransition { from, to: next });
        }

        conversation.indexing_status = next;
        self.write(&conversation_key(id), &conversation).await?;
        info!("Conversation {} indexing: {} -> {}", id, from, next);
        Ok(conversation)
    }

    pub async fn cancel_indexing(&self, id: &str) -> Result<Conversation> {
        let _guard = self.lock(id).await;
        let mut conversation = self.load_conversation(id).await?;
        let from = conversation.indexing_status;
        if !from.can_cancel() {
            return Err(ConversationError::InvalidTransition {
                from,
                to: IndexingStatus::Canceled,
            });
        }

        conversation.indexing_status = IndexingStatus::Canceled;
        self.write(&conversation_key(id), &conversation).await?;
        info!("Conversation {} indexing canceled", id);
        Ok(conversation)
    }
}

#[async_trait]
impl EventRecorder for ConversationStore {
    async fn record(&self, ctx: &TraceContext, event: &RunEvent) -> anyhow::Result<()> {
        Ok(self.record_event(ctx, event).await?)
    }
}

//! Persisted conversation entities.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChatMessage, Role, ToolCall};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    #[default]
    None,
    Pending,
    Indexed,
    Failed,
    Canceled,
}

impl IndexingStatus {
    /// Whether `self -> next` is a legal indexing transition.
    ///
    /// `none -> pending -> {indexed, failed}`; finished or canceled
    /// conversations may be queued again. Cancellation goes through
    /// [`IndexingStatus::can_cancel`].
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::None | Self::Indexed | Self::Failed | Self::Canceled, Self::Pending)
                | (Self::Pending, Self::Indexed | Self::Failed)
        )
    }

    #[must_use]
    pub const fn can_cancel(self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Pending => write!(f, "pending"),
            Self::Indexed => write!(f, "indexed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub owner_id: String,
    #[serde(default)]
    pub indexing_status: IndexingStatus,
}

impl Conversation {
    #[must_use]
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: ConversationStatus::Open,
            created_at: now,
            last_touched_at: now,
            owner_id: owner_id.into(),
            indexing_status: IndexingStatus::None,
        }
    }

    pub fn touch(&mut self) {
        self.last_touched_at = Utc::now();
    }
}

/// One inbound client call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub conversation_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latency_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Started and not yet ended.
    Running,
    Ok,
    Error,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Ok,
    Error { error_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TurnStatus,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// A persisted message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ISO-8601 timestamp; may be absent or unparseable in legacy data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessageRecord {
    /// Build a record for `message`, stamped now. Reuses the message id when present.
    #[must_use]
    pub fn from_message(conversation_id: impl Into<String>, message: &ChatMessage) -> Self {
        Self::from_message_at(conversation_id, message, Utc::now())
    }

    /// Build a record for `message` stamped `at`, kept to microsecond precision.
    #[must_use]
    pub fn from_message_at(
        conversation_id: impl Into<String>,
        message: &ChatMessage,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: message
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
            conversation_id: conversation_id.into(),
            role: message.role,
            content: message.content.clone(),
            name: message.name.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls: (!message.tool_calls.is_empty()).then(|| message.tool_calls.clone()),
            created_at: Some(at.to_rfc3339_opts(SecondsFormat::Micros, true)),
            metadata: None,
        }
    }

    /// The `traceType` tag of llm-call trace records stored as system messages.
    #[must_use]
    pub fn trace_type(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("traceType"))
            .and_then(serde_json::Value::as_str)
    }

    /// Microseconds since the epoch, or `None` when absent or unparseable.
    #[must_use]
    pub fn created_at_micros(&self) -> Option<i64> {
        self.created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.timestamp_micros())
    }

    #[must_use]
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            id: Some(self.id.clone()),
            role: self.role,
            content: self.content.clone(),
            name: self.name.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls: self.tool_calls.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexing_transitions() {
        use IndexingStatus::{Canceled, Failed, Indexed, None, Pending};

        assert!(None.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Indexed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Canceled.can_transition_to(Pending));

        assert!(!None.can_transition_to(Indexed));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Indexed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Canceled));

        assert!(Pending.can_cancel());
        assert!(!Indexed.can_cancel());
        assert!(!Failed.can_cancel());
        assert!(!Canceled.can_cancel());
    }

    #[test]
    fn created_at_parsing() {
        let mut record = MessageRecord::from_message("c1", &ChatMessage::user("hi"));
        assert!(record.created_at_micros().is_some());

        record.created_at = Some("2024-05-01T10:00:00.000001Z".to_string());
        assert_eq!(record.created_at_micros(), Some(1_714_557_600_000_001));

        record.created_at = Some("not a date".to_string());
        assert_eq!(record.created_at_micros(), Option::None);

        record.created_at = Option::None;
        assert_eq!(record.created_at_micros(), Option::None);
    }

    #[test]
    fn stamps_keep_microseconds() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456789Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_default();
        let record = MessageRecord::from_message_at("c1", &ChatMessage::user("hi"), at);
        assert_eq!(
            record.created_at.as_deref(),
            Some("2024-05-01T10:00:00.123456Z")
        );
    }

    #[test]
    fn trace_type_reads_metadata() {
        let mut record = MessageRecord::from_message("c1", &ChatMessage::system("trace"));
        assert_eq!(record.trace_type(), Option::None);

        record.metadata = Some(serde_json::json!({ "traceType": "llm_call" }));
        assert_eq!(record.trace_type(), Some("llm_call"));
    }

    #[test]
    fn message_id_is_kept() {
        let record = MessageRecord::from_message("c1", &ChatMessage::user("hi").with_id("m1"));
        assert_eq!(record.id, "m1");
        assert_eq!(record.to_message().id.as_deref(), Some("m1"));
    }
}

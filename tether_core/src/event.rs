//! The run event union shared by the streaming and persistence paths.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ChatMessage, Usage};

/// One event of a run, in generation order.
///
/// `Done` is the terminal sentinel. Exactly one is delivered per output stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Delta {
        text: String,
    },
    LlmCall {
        call_id: String,
        model: String,
    },
    LlmCallComplete {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    ToolCallComplete {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Message {
        message: ChatMessage,
    },
    Error {
        message: String,
        error_type: String,
    },
    Done,
}

impl RunEvent {
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        matches!(self, Self::Done)
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::LlmCall { .. } => "llm_call",
            Self::LlmCallComplete { .. } => "llm_call_complete",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolCallComplete { .. } => "tool_call_complete",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

/// Identifies the conversation, request and turn an event belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub conversation_id: String,
    pub request_id: String,
    pub turn_id: String,
}

/// Persists run events before they are forwarded to clients.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, ctx: &TraceContext, event: &RunEvent) -> anyhow::Result<()>;
}

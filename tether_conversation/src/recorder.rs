use async_trait::async_trait;
use tether_core::{ChatMessage, MessageRecord, RunEvent, TraceContext, Usage};

use crate::error::Result;
use crate::store::ConversationStore;

/// Write side of a run as seen by the orchestration layer.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record_llm_call_start(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        model: &str,
    ) -> Result<()>;

    async fn record_llm_call_complete(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        usage: Option<Usage>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn record_tool_call_start(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<()>;

    async fn record_tool_call_complete(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn record_message(&self, ctx: &TraceContext, message: &ChatMessage) -> Result<()>;

    /// Persist the messages of `messages` not yet stored for the conversation.
    async fn sync_history(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<MessageRecord>>;
}

#[async_trait]
impl Recorder for ConversationStore {
    async fn record_llm_call_start(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        model: &str,
    ) -> Result<()> {
        self.record_event(
            ctx,
            &RunEvent::LlmCall {
                call_id: call_id.to_string(),
                model: model.to_string(),
            },
        )
        .await
    }

    async fn record_llm_call_complete(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        usage: Option<Usage>,
        error: Option<&str>,
    ) -> Result<()> {
        self.record_event(
            ctx,
            &RunEvent::LlmCallComplete {
                call_id: call_id.to_string(),
                usage,
                error: error.map(ToString::to_string),
            },
        )
        .await
    }

    async fn record_tool_call_start(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<()> {
        self.record_event(
            ctx,
            &RunEvent::ToolCall {
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.clone(),
            },
        )
        .await
    }

    async fn record_tool_call_complete(
        &self,
        ctx: &TraceContext,
        call_id: &str,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.record_event(
            ctx,
            &RunEvent::ToolCallComplete {
                call_id: call_id.to_string(),
                result: result.map(ToString::to_string),
                error: error.map(ToString::to_string),
            },
        )
        .await
    }

    async fn record_message(&self, ctx: &TraceContext, message: &ChatMessage) -> Result<()> {
        self.append_message(&ctx.conversation_id, message)
            .await
            .map(|_| ())
    }

    async fn sync_history(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<MessageRecord>> {
        self.sync_messages(conversation_id, messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_core::MemoryKvStore;

    #[tokio::test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    async fn test_recorder_round_trip_through_store() {
        let store = ConversationStore::new(Arc::new(MemoryKvStore::new()));
        let recorder: &dyn Recorder = &store;
        let ctx = TraceContext {
            conversation_id: "c1".to_string(),
            request_id: "r1".to_string(),
            turn_id: "t1".to_string(),
        };

        recorder
            .record_tool_call_start(&ctx, "call-1", "weather", &serde_json::json!({"city": "Oslo"}))
            .await
            .expect("start failed");
        recorder
            .record_tool_call_complete(&ctx, "call-1", Some("sunny"), None)
            .await
            .expect("complete failed");
        recorder
            .record_message(&ctx, &ChatMessage::assistant("It is sunny in Oslo."))
            .await
            .expect("message failed");

        let traces = store.traces("c1").await.expect("traces failed");
        assert_eq!(traces.len(), 2);
        assert!(matches!(
            &traces[1].event,
            RunEvent::ToolCallComplete { result: Some(r), error: None, .. } if r == "sunny"
        ));

        let synced = recorder
            .sync_history("c1", &[ChatMessage::assistant("It is sunny in Oslo.")])
            .await
            .expect("sync failed");
        assert!(synced.is_empty());
        assert_eq!(store.history("c1").await.expect("history failed").len(), 1);
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tether_conversation::{ConversationStore, MessageReconciler};
use tether_core::{
    ChatMessage, LLMCaller, LLMResponse, MemoryKvStore, Role, RunEvent, Tool, ToolCall,
    ToolDefinition, ToolRegistry, ToolResult, TurnStatus, Usage,
};
use tether_runtime::{
    ConversationEngine, MultitaskStrategy, RunHandle, RuntimeConfig, ThreadState, TurnRequest,
};
use tokio::sync::{Mutex, Notify};

/// Answers every call with the same text and remembers what it was shown.
#[derive(Default)]
struct Echo {
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

#[async_trait]
impl LLMCaller for Echo {
    async fn call(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> anyhow::Result<LLMResponse> {
        self.seen.lock().await.push(messages.to_vec());
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(LLMResponse {
            text: format!("echo: {last}"),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
            }),
            ..LLMResponse::default()
        })
    }
}

/// Blocks the first call forever; later calls answer at once.
struct Gate {
    entered: Notify,
    calls: Mutex<usize>,
}

#[async_trait]
impl LLMCaller for Gate {
    async fn call(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> anyhow::Result<LLMResponse> {
        let first = {
            let mut calls = self.calls.lock().await;
            *calls += 1;
            *calls == 1
        };
        if first {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(LLMResponse {
            text: "second answer".to_string(),
            ..LLMResponse::default()
        })
    }
}

struct Slow;

#[async_trait]
impl LLMCaller for Slow {
    async fn call(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> anyhow::Result<LLMResponse> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(LLMResponse::default())
    }
}

/// Asks for the weather tool until it has seen a tool result, then answers.
struct Forecaster;

#[async_trait]
impl LLMCaller for Forecaster {
    async fn call(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> anyhow::Result<LLMResponse> {
        if messages.iter().any(|m| m.role == Role::Tool) {
            return Ok(LLMResponse {
                text: "It is sunny".to_string(),
                ..LLMResponse::default()
            });
        }
        Ok(LLMResponse {
            tool_calls: vec![ToolCall {
                id: "call-1".to_string(),
                name: "weather".to_string(),
                arguments: serde_json::json!({ "city": "Oslo" }),
            }],
            ..LLMResponse::default()
        })
    }
}

struct Weather;

#[async_trait]
impl Tool for Weather {
    fn name(&self) -> &str {
        "weather"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "weather".to_string(),
            description: "Current weather for a city".to_string(),
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        ToolResult::success("sunny")
    }
}

fn engine(llm: Arc<dyn LLMCaller>, config: RuntimeConfig) -> ConversationEngine {
    engine_with_tools(llm, ToolRegistry::new(), config)
}

fn engine_with_tools(
    llm: Arc<dyn LLMCaller>,
    tools: ToolRegistry,
    config: RuntimeConfig,
) -> ConversationEngine {
    let store = Arc::new(ConversationStore::new(Arc::new(MemoryKvStore::new())));
    ConversationEngine::new(store, llm, Arc::new(tools), config)
}

fn request(conversation_id: Option<&str>, messages: Vec<ChatMessage>) -> TurnRequest {
    TurnRequest {
        conversation_id: conversation_id.map(ToString::to_string),
        owner_id: "owner-1".to_string(),
        model: "test-model".to_string(),
        system_prompt: Some("You are terse.".to_string()),
        messages,
    }
}

async fn drain(handle: RunHandle) -> Vec<RunEvent> {
    tokio::time::timeout(Duration::from_secs(10), handle.events.collect())
        .await
        .unwrap_or_default()
}

fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::kind).collect()
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_turn_runs_end_to_end() {
    let llm = Arc::new(Echo::default());
    let engine = engine(llm.clone(), RuntimeConfig::default());

    let handle = engine
        .submit(request(None, vec![ChatMessage::user("hello")]))
        .await
        .expect("submit failed");
    assert_eq!(handle.strategy, MultitaskStrategy::Normal);
    let conversation_id = handle.conversation_id.clone();
    let turn_id = handle.turn_id.clone();
    let request_id = handle.request_id.clone();

    let events = drain(handle).await;
    assert_eq!(
        kinds(&events),
        vec!["llm_call", "llm_call_complete", "delta", "message", "done"]
    );

    let store = engine.store();
    let turn = store
        .get_turn(&turn_id)
        .await
        .expect("get_turn failed")
        .expect("turn missing");
    assert_eq!(turn.status, TurnStatus::Ok);
    let request = store
        .get_request(&request_id)
        .await
        .expect("get_request failed")
        .expect("request missing");
    assert!(request.completed_at.is_some());
    assert_eq!(engine.dispatcher().state(&conversation_id).await, ThreadState::Idle);

    let history: Vec<_> = store
        .history(&conversation_id)
        .await
        .expect("history failed")
        .into_iter()
        .filter(|r| r.trace_type().is_none())
        .collect();
    let roles: Vec<Role> = history.iter().map(|r| r.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(history[1].content, "echo: hello");

    let seen = llm.seen.lock().await;
    assert_eq!(seen[0][0].role, Role::System);
    assert_eq!(seen[0][0].content, "You are terse.");
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_events_are_recorded_before_forwarding() {
    let engine = engine(Arc::new(Echo::default()), RuntimeConfig::default());
    let mut handle = engine
        .submit(request(None, vec![ChatMessage::user("hello")]))
        .await
        .expect("submit failed");

    while let Some(event) = handle.events.next().await {
        if let RunEvent::Message { message } = &event {
            let history = engine
                .store()
                .history(&handle.conversation_id)
                .await
                .expect("history failed");
            assert!(
                history.iter().any(|r| Some(&r.id) == message.id.as_ref()),
                "message forwarded before it was stored"
            );
        }
        if let RunEvent::LlmCallComplete { call_id, .. } = &event {
            let traces = engine
                .store()
                .traces(&handle.conversation_id)
                .await
                .expect("traces failed");
            assert!(traces.iter().any(|t| matches!(
                &t.event,
                RunEvent::LlmCallComplete { call_id: id, .. } if id == call_id
            )));
        }
    }
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_resubmitted_transcript_is_reconciled() {
    let llm = Arc::new(Echo::default());
    let engine = engine(llm.clone(), RuntimeConfig::default());

    let first = engine
        .submit(request(None, vec![ChatMessage::user("hello").with_id("u-1")]))
        .await
        .expect("submit failed");
    let conversation_id = first.conversation_id.clone();
    let events = drain(first).await;
    let answer = events
        .iter()
        .find_map(|e| match e {
            RunEvent::Message { message } => Some(message.clone()),
            _ => None,
        })
        .expect("no assistant message");

    // The client sends its whole transcript back with the ids it was given.
    let second = engine
        .submit(request(
            Some(&conversation_id),
            vec![
                ChatMessage::system("client side prompt"),
                ChatMessage::user("hello").with_id("u-1"),
                answer,
                ChatMessage::user("and again"),
            ],
        ))
        .await
        .expect("submit failed");
    drain(second).await;

    let seen = llm.seen.lock().await;
    let contents: Vec<&str> = seen[1].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "You are terse.",
            "hello",
            "echo: hello",
            "client side prompt",
            "and again",
        ]
    );
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_new_turn_interrupts_active_run() {
    let gate = Arc::new(Gate {
        entered: Notify::new(),
        calls: Mutex::new(0),
    });
    let engine = engine(gate.clone(), RuntimeConfig::default());

    let first = engine
        .submit(request(None, vec![ChatMessage::user("slow question")]))
        .await
        .expect("submit failed");
    let conversation_id = first.conversation_id.clone();
    let first_turn = first.turn_id.clone();
    gate.entered.notified().await;
    assert!(matches!(
        engine.dispatcher().state(&conversation_id).await,
        ThreadState::Busy { run_id, .. } if run_id == first.run_id
    ));

    let second = engine
        .submit(request(
            Some(&conversation_id),
            vec![ChatMessage::user("never mind")],
        ))
        .await
        .expect("submit failed");
    assert_eq!(second.strategy, MultitaskStrategy::Interrupt);
    let second_turn = second.turn_id.clone();

    let first_events = drain(first).await;
    assert_eq!(
        kinds(&first_events),
        vec!["llm_call", "llm_call_complete", "done"]
    );
    assert!(matches!(
        &first_events[1],
        RunEvent::LlmCallComplete { error: Some(reason), .. } if reason == "cancelled"
    ));

    let second_events = drain(second).await;
    assert_eq!(second_events.iter().filter(|e| e.is_sentinel()).count(), 1);
    assert!(second_events.last().is_some_and(RunEvent::is_sentinel));

    let store = engine.store();
    let interrupted = store
        .get_turn(&first_turn)
        .await
        .expect("get_turn failed")
        .expect("turn missing");
    assert_eq!(interrupted.status, TurnStatus::Error);
    assert_eq!(interrupted.error_type.as_deref(), Some("cancelled"));

    let finished = store
        .get_turn(&second_turn)
        .await
        .expect("get_turn failed")
        .expect("turn missing");
    assert_eq!(finished.status, TurnStatus::Ok);
    assert_eq!(engine.dispatcher().state(&conversation_id).await, ThreadState::Idle);
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_timeout_fails_turn_but_terminates_stream() {
    let config = RuntimeConfig {
        inference_timeout: Duration::from_millis(50),
        ..RuntimeConfig::default()
    };
    let engine = engine(Arc::new(Slow), config);

    let handle = engine
        .submit(request(None, vec![ChatMessage::user("hello")]))
        .await
        .expect("submit failed");
    let turn_id = handle.turn_id.clone();

    let events = drain(handle).await;
    assert_eq!(
        kinds(&events),
        vec!["llm_call", "llm_call_complete", "error", "done"]
    );
    assert!(matches!(
        &events[2],
        RunEvent::Error { error_type, .. } if error_type == "run_timeout"
    ));

    let turn = engine
        .store()
        .get_turn(&turn_id)
        .await
        .expect("get_turn failed")
        .expect("turn missing");
    assert_eq!(turn.status, TurnStatus::Error);
    assert_eq!(turn.error_type.as_deref(), Some("run_timeout"));
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_dropped_client_cancels_run() {
    let engine = engine(Arc::new(Slow), RuntimeConfig::default());

    let handle = engine
        .submit(request(None, vec![ChatMessage::user("hello")]))
        .await
        .expect("submit failed");
    let conversation_id = handle.conversation_id.clone();
    let turn_id = handle.turn_id.clone();
    drop(handle);

    let released = tokio::time::timeout(Duration::from_secs(10), async {
        while engine.dispatcher().state(&conversation_id).await != ThreadState::Idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "run was not cancelled");

    let turn = engine
        .store()
        .get_turn(&turn_id)
        .await
        .expect("get_turn failed")
        .expect("turn missing");
    assert_eq!(turn.error_type.as_deref(), Some("cancelled"));
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn test_tool_turn_rehydrates_in_write_order() {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(Weather));
    let engine = engine_with_tools(Arc::new(Forecaster), tools, RuntimeConfig::default());

    let handle = engine
        .submit(request(None, vec![ChatMessage::user("weather?")]))
        .await
        .expect("submit failed");
    let conversation_id = handle.conversation_id.clone();
    drain(handle).await;

    let timeline = MessageReconciler::default()
        .hydrate(engine.store(), &conversation_id, vec![])
        .await
        .expect("hydrate failed");
    let lines: Vec<String> = timeline
        .iter()
        .map(|m| format!("{}:{}", m.role, m.content))
        .collect();
    assert_eq!(
        lines,
        vec![
            "user:weather?",
            "assistant:",
            "tool:sunny",
            "assistant:It is sunny"
        ]
    );
}

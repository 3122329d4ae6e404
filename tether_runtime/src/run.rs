//! The agent turn: model calls interleaved with tool executions.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{ChatMessage, LLMCaller, RunEvent, ToolDefinition, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::sequencer::EventSource;

/// Everything one agent turn needs.
pub struct AgentTurn {
    pub llm: Arc<dyn LLMCaller>,
    pub tools: Arc<ToolRegistry>,
    pub model: String,
    /// Full model context, system prompt included.
    pub messages: Vec<ChatMessage>,
    pub inference_timeout: Duration,
    pub max_tool_rounds: usize,
    pub cancel: CancellationToken,
}

/// Run the model until it answers without tool calls.
///
/// After `max_tool_rounds` rounds of tool use the model is called once more
/// with no tools on offer. Each model call is bounded by
/// `inference_timeout`; a timeout completes the open `llm_call` with an
/// error and then fails the source with [`RuntimeError::RunTimeout`].
/// Tool failures are reported to the model, not raised.
#[must_use]
pub fn agent_turn(turn: AgentTurn) -> EventSource {
    Box::pin(async_stream::stream! {
        let AgentTurn {
            llm,
            tools,
            model,
            mut messages,
            inference_timeout,
            max_tool_rounds,
            cancel,
        } = turn;
        let definitions = tools.definitions();
        let no_tools: Vec<ToolDefinition> = Vec::new();

        for round in 0..=max_tool_rounds {
            if cancel.is_cancelled() {
                yield Err(RuntimeError::Cancelled);
                return;
            }

            let offered = if round < max_tool_rounds { &definitions } else { &no_tools };
            let call_id = Uuid::now_v7().to_string();
            yield Ok(RunEvent::LlmCall {
                call_id: call_id.clone(),
                model: model.clone(),
            });

            debug!("LLM call {} (round {}) with {} messages", call_id, round, messages.len());
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = tokio::time::timeout(
                    inference_timeout,
                    llm.call(&model, &messages, offered),
                ) => Some(result),
            };

            let response = match outcome {
                None => {
                    yield Err(RuntimeError::Cancelled);
                    return;
                }
                Some(Err(_elapsed)) => {
                    warn!("LLM call {} timed out after {:?}", call_id, inference_timeout);
                    let error = RuntimeError::RunTimeout { after: inference_timeout };
                    yield Ok(RunEvent::LlmCallComplete {
                        call_id,
                        usage: None,
                        error: Some(error.to_string()),
                    });
                    yield Err(error);
                    return;
                }
                Some(Ok(Err(e))) => {
                    yield Ok(RunEvent::LlmCallComplete {
                        call_id,
                        usage: None,
                        error: Some(format!("{e:#}")),
                    });
                    yield Err(RuntimeError::Llm(e));
                    return;
                }
                Some(Ok(Ok(response))) => response,
            };

            yield Ok(RunEvent::LlmCallComplete {
                call_id,
                usage: response.usage,
                error: None,
            });
            if !response.text.is_empty() {
                yield Ok(RunEvent::Delta { text: response.text.clone() });
            }

            let tool_calls = if offered.is_empty() && !response.tool_calls.is_empty() {
                warn!(
                    "Ignoring {} tool calls after {} tool rounds",
                    response.tool_calls.len(),
                    max_tool_rounds
                );
                Vec::new()
            } else {
                response.tool_calls
            };

            let assistant = ChatMessage::assistant(response.text)
                .with_id(Uuid::now_v7().to_string())
                .with_tool_calls(tool_calls.clone());
            messages.push(assistant.clone());
            yield Ok(RunEvent::Message { message: assistant });

            if tool_calls.is_empty() {
                info!("Agent turn finished after {} tool rounds", round);
                return;
            }

            for call in tool_calls {
                if cancel.is_cancelled() {
                    yield Err(RuntimeError::Cancelled);
                    return;
                }

                yield Ok(RunEvent::ToolCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });

                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    result = tools.execute(&call.name, call.arguments.clone()) => Some(result),
                };
                let Some(result) = result else {
                    yield Err(RuntimeError::Cancelled);
                    return;
                };

                let (ok, err) = if result.is_error {
                    (None, Some(result.content.clone()))
                } else {
                    (Some(result.content.clone()), None)
                };
                yield Ok(RunEvent::ToolCallComplete {
                    call_id: call.id.clone(),
                    result: ok,
                    error: err,
                });

                let tool_message = ChatMessage::tool(call.id, result.content)
                    .with_id(Uuid::now_v7().to_string());
                messages.push(tool_message.clone());
                yield Ok(RunEvent::Message { message: tool_message });
            }
        }
    })
}

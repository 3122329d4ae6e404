//! Drains chained event sources into one recorded, sentinel-terminated stream.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tether_core::{EventRecorder, RunEvent, TraceContext};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RuntimeError;

/// A source of run events. An `Err` item ends the source and the run.
pub type EventSource = BoxStream<'static, Result<RunEvent, RuntimeError>>;

/// Reason recorded on traces closed by cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

/// LLM and tool calls that have started but not completed.
#[derive(Debug, Default)]
struct OpenTraces {
    llm_calls: Vec<String>,
    tool_calls: Vec<String>,
}

impl OpenTraces {
    fn observe(&mut self, event: &RunEvent) {
        match event {
            RunEvent::LlmCall { call_id, .. } => self.llm_calls.push(call_id.clone()),
            RunEvent::LlmCallComplete { call_id, .. } => self.llm_calls.retain(|id| id != call_id),
            RunEvent::ToolCall { call_id, .. } => self.tool_calls.push(call_id.clone()),
            RunEvent::ToolCallComplete { call_id, .. } => {
                self.tool_calls.retain(|id| id != call_id);
            }
            RunEvent::Delta { .. }
            | RunEvent::Message { .. }
            | RunEvent::Error { .. }
            | RunEvent::Done => {}
        }
    }

    /// Completion events for every open trace, innermost first.
    fn close(&mut self, reason: &str) -> Vec<RunEvent> {
        let tools = self.tool_calls.drain(..).rev().map(|call_id| RunEvent::ToolCallComplete {
            call_id,
            result: None,
            error: Some(reason.to_string()),
        });
        let llms = self.llm_calls.drain(..).rev().map(|call_id| RunEvent::LlmCallComplete {
            call_id,
            usage: None,
            error: Some(reason.to_string()),
        });
        tools.chain(llms).collect()
    }
}

enum Step {
    Event(RunEvent),
    Failed(RuntimeError),
    Exhausted,
    Cancelled,
}

enum Ending {
    Drained,
    Cancelled,
    Failed(RuntimeError),
}

/// Registers event sources for one run.
///
/// Sources are drained in the order they were chained. Every event is
/// recorded before it is forwarded. The output ends with exactly one
/// [`RunEvent::Done`], whether the sources drain, fail or are cancelled.
pub struct EventSequencer {
    sources: mpsc::UnboundedSender<EventSource>,
}

impl EventSequencer {
    /// Create a sequencer and the output stream it feeds.
    #[must_use]
    pub fn new(
        recorder: Arc<dyn EventRecorder>,
        ctx: TraceContext,
        cancel: CancellationToken,
    ) -> (Self, BoxStream<'static, RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let output = sequence(recorder, ctx, cancel, rx);
        (Self { sources: tx }, output)
    }

    /// Queue another source behind the ones already chained.
    pub fn chain(&self, source: EventSource) {
        if self.sources.send(source).is_err() {
            debug!("Output stream already finished, dropping chained source");
        }
    }

    /// Declare that no further sources will be chained.
    pub fn done(self) {
        drop(self.sources);
    }
}

async fn record_best_effort(recorder: &dyn EventRecorder, ctx: &TraceContext, event: &RunEvent) {
    if let Err(e) = recorder.record(ctx, event).await {
        warn!("Failed to record {} for turn {}: {e:#}", event.kind(), ctx.turn_id);
    }
}

fn sequence(
    recorder: Arc<dyn EventRecorder>,
    ctx: TraceContext,
    cancel: CancellationToken,
    mut sources: mpsc::UnboundedReceiver<EventSource>,
) -> BoxStream<'static, RunEvent> {
    Box::pin(async_stream::stream! {
        let mut open = OpenTraces::default();
        let mut ending = Ending::Drained;

        'sources: loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                source = sources.recv() => Some(source),
            };
            let mut source = match next {
                None => {
                    ending = Ending::Cancelled;
                    break 'sources;
                }
                Some(None) => break 'sources,
                Some(Some(source)) => source,
            };

            loop {
                let step = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Step::Cancelled,
                    item = source.next() => match item {
                        Some(Ok(event)) => Step::Event(event),
                        Some(Err(e)) => Step::Failed(e),
                        None => Step::Exhausted,
                    },
                };

                match step {
                    Step::Exhausted => break,
                    Step::Cancelled => {
                        ending = Ending::Cancelled;
                        break 'sources;
                    }
                    Step::Failed(e) => {
                        ending = Ending::Failed(e);
                        break 'sources;
                    }
                    // Only the sequencer emits the sentinel.
                    Step::Event(RunEvent::Done) => {}
                    Step::Event(event) => {
                        if let Err(e) = recorder.record(&ctx, &event).await {
                            ending = Ending::Failed(RuntimeError::Record(format!("{e:#}")));
                            break 'sources;
                        }
                        open.observe(&event);
                        yield event;
                    }
                }
            }
        }

        match ending {
            Ending::Drained => {}
            Ending::Cancelled => {
                debug!("Run for turn {} cancelled", ctx.turn_id);
                for event in open.close(CANCELLED_REASON) {
                    record_best_effort(recorder.as_ref(), &ctx, &event).await;
                    yield event;
                }
            }
            Ending::Failed(e) => {
                warn!("Run for turn {} failed: {e}", ctx.turn_id);
                for event in open.close(&e.to_string()) {
                    record_best_effort(recorder.as_ref(), &ctx, &event).await;
                    yield event;
                }
                let event = RunEvent::Error {
                    message: e.to_string(),
                    error_type: e.error_type().to_string(),
                };
                record_best_effort(recorder.as_ref(), &ctx, &event).await;
                yield event;
            }
        }

        yield RunEvent::Done;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryRecorder {
        events: Mutex<Vec<RunEvent>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl EventRecorder for MemoryRecorder {
        async fn record(&self, _ctx: &TraceContext, event: &RunEvent) -> anyhow::Result<()> {
            if self.fail_on == Some(event.kind()) {
                anyhow::bail!("store down");
            }
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn ctx() -> TraceContext {
        TraceContext {
            conversation_id: "c1".to_string(),
            request_id: "r1".to_string(),
            turn_id: "t1".to_string(),
        }
    }

    fn delta(text: &str) -> RunEvent {
        RunEvent::Delta {
            text: text.to_string(),
        }
    }

    fn source(items: Vec<Result<RunEvent, RuntimeError>>) -> EventSource {
        Box::pin(stream::iter(items))
    }

    fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(RunEvent::kind).collect()
    }

    #[tokio::test]
    async fn test_sources_drain_in_chain_order() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (sequencer, output) =
            EventSequencer::new(recorder.clone(), ctx(), CancellationToken::new());

        sequencer.chain(source(vec![Ok(delta("a")), Ok(delta("b"))]));
        sequencer.chain(source(vec![Ok(RunEvent::Done), Ok(delta("c"))]));
        sequencer.done();

        let events: Vec<RunEvent> = output.collect().await;
        assert_eq!(
            events,
            vec![delta("a"), delta("b"), delta("c"), RunEvent::Done]
        );
        assert_eq!(recorder.events.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_throwing_source_yields_error_then_sentinel() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (sequencer, output) =
            EventSequencer::new(recorder.clone(), ctx(), CancellationToken::new());

        sequencer.chain(source(vec![
            Ok(RunEvent::LlmCall {
                call_id: "c1".to_string(),
                model: "m".to_string(),
            }),
            Err(RuntimeError::Llm(anyhow::anyhow!("upstream 500"))),
            Ok(delta("never")),
        ]));
        sequencer.chain(source(vec![Ok(delta("also never"))]));
        sequencer.done();

        let events: Vec<RunEvent> = output.collect().await;
        assert_eq!(
            kinds(&events),
            vec!["llm_call", "llm_call_complete", "error", "done"]
        );
        assert!(matches!(
            &events[2],
            RunEvent::Error { error_type, .. } if error_type == "llm_error"
        ));
        assert_eq!(events.iter().filter(|e| e.is_sentinel()).count(), 1);

        let recorded = recorder.events.lock().await;
        assert_eq!(kinds(&recorded), vec!["llm_call", "llm_call_complete", "error"]);
    }

    #[tokio::test]
    async fn test_cancel_closes_open_traces() {
        let recorder = Arc::new(MemoryRecorder::default());
        let cancel = CancellationToken::new();
        let (sequencer, mut output) = EventSequencer::new(recorder.clone(), ctx(), cancel.clone());

        let pending: EventSource = Box::pin(
            stream::iter(vec![
                Ok(RunEvent::LlmCall {
                    call_id: "l1".to_string(),
                    model: "m".to_string(),
                }),
                Ok(RunEvent::ToolCall {
                    call_id: "t1".to_string(),
                    name: "weather".to_string(),
                    arguments: serde_json::Value::Null,
                }),
            ])
            .chain(stream::pending()),
        );
        sequencer.chain(pending);

        assert_eq!(output.next().await.as_ref().map(RunEvent::kind), Some("llm_call"));
        assert_eq!(output.next().await.as_ref().map(RunEvent::kind), Some("tool_call"));
        cancel.cancel();

        let rest: Vec<RunEvent> = tokio::time::timeout(Duration::from_secs(5), output.collect())
            .await
            .unwrap_or_default();
        assert_eq!(
            rest,
            vec![
                RunEvent::ToolCallComplete {
                    call_id: "t1".to_string(),
                    result: None,
                    error: Some(CANCELLED_REASON.to_string()),
                },
                RunEvent::LlmCallComplete {
                    call_id: "l1".to_string(),
                    usage: None,
                    error: Some(CANCELLED_REASON.to_string()),
                },
                RunEvent::Done,
            ]
        );
        assert_eq!(recorder.events.lock().await.len(), 4);
        drop(sequencer);
    }

    #[tokio::test]
    async fn test_record_failure_stops_forwarding() {
        let recorder = Arc::new(MemoryRecorder {
            fail_on: Some("message"),
            ..MemoryRecorder::default()
        });
        let (sequencer, output) = EventSequencer::new(recorder, ctx(), CancellationToken::new());

        sequencer.chain(source(vec![
            Ok(delta("a")),
            Ok(RunEvent::Message {
                message: tether_core::ChatMessage::assistant("a"),
            }),
            Ok(delta("b")),
        ]));
        sequencer.done();

        let events: Vec<RunEvent> = output.collect().await;
        assert_eq!(kinds(&events), vec!["delta", "error", "done"]);
        assert!(matches!(
            &events[1],
            RunEvent::Error { error_type, .. } if error_type == "record_failed"
        ));
    }

    #[tokio::test]
    async fn test_output_waits_for_done() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (sequencer, mut output) =
            EventSequencer::new(recorder, ctx(), CancellationToken::new());

        sequencer.chain(source(vec![Ok(delta("a"))]));
        assert_eq!(output.next().await, Some(delta("a")));

        let early = tokio::time::timeout(Duration::from_millis(50), output.next()).await;
        assert!(early.is_err(), "stream ended before done()");

        sequencer.chain(source(vec![Ok(delta("b"))]));
        sequencer.done();
        let rest: Vec<RunEvent> = output.collect().await;
        assert_eq!(rest, vec![delta("b"), RunEvent::Done]);
    }
}

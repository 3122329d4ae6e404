//! Submitting a turn end to end.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tether_conversation::{ConversationStore, MessageReconciler, ReconcileConfig, Recorder};
use tether_core::{
    ChatMessage, EventRecorder, LLMCaller, RunEvent, ToolRegistry, TraceContext, TurnOutcome,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{MultitaskStrategy, RunDispatcher, RunTicket};
use crate::error::{Result, RuntimeError};
use crate::run::{AgentTurn, agent_turn};
use crate::sequencer::EventSequencer;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub inference_timeout: Duration,
    pub max_tool_rounds: usize,
    /// Capacity of each run's output channel.
    pub output_buffer: usize,
    pub reconcile: ReconcileConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inference_timeout: Duration::from_secs(300),
            max_tool_rounds: 8,
            output_buffer: 64,
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// One client call asking for a new turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Existing conversation to continue. A new one is created when absent.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub owner_id: String,
    pub model: String,
    /// Prepended to the model context for this turn only. Never persisted.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// A submitted run and its event stream.
pub struct RunHandle {
    pub run_id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub turn_id: String,
    pub strategy: MultitaskStrategy,
    /// Ends with exactly one [`RunEvent::Done`]. Dropping it cancels the run.
    pub events: BoxStream<'static, RunEvent>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("conversation_id", &self.conversation_id)
            .field("request_id", &self.request_id)
            .field("turn_id", &self.turn_id)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Ties the conversation store, dispatcher, reconciler and agent together.
pub struct ConversationEngine {
    store: Arc<ConversationStore>,
    dispatcher: Arc<RunDispatcher>,
    reconciler: MessageReconciler,
    llm: Arc<dyn LLMCaller>,
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
}

/// What the run task needs to close out a run.
struct Finalizer {
    store: Arc<ConversationStore>,
    dispatcher: Arc<RunDispatcher>,
    ticket: RunTicket,
    request_id: String,
    turn_id: String,
}

impl Finalizer {
    async fn finish(&self, error_type: Option<String>) {
        let outcome = match error_type {
            Some(error_type) => TurnOutcome::Error { error_type },
            None if self.ticket.cancel.is_cancelled() => TurnOutcome::Error {
                error_type: RuntimeError::Cancelled.error_type().to_string(),
            },
            None => TurnOutcome::Ok,
        };

        if let Err(e) = self.store.end_turn(&self.turn_id, outcome).await {
            warn!("Failed to end turn {}: {}", self.turn_id, e);
        }
        if let Err(e) = self.store.complete_request(&self.request_id).await {
            warn!("Failed to complete request {}: {}", self.request_id, e);
        }
        self.dispatcher
            .complete(&self.ticket.thread_id, &self.ticket.run_id)
            .await;
    }
}

impl ConversationEngine {
    #[must_use]
    pub fn new(
        store: Arc<ConversationStore>,
        llm: Arc<dyn LLMCaller>,
        tools: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            dispatcher: Arc::new(RunDispatcher::new()),
            reconciler: MessageReconciler::new(config.reconcile.clone()),
            llm,
            tools,
            config,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<RunDispatcher> {
        &self.dispatcher
    }

    /// Start a turn and return its event stream.
    ///
    /// The conversation is created if needed, the thread is claimed (interrupting
    /// any active run), history is reconciled with the submitted messages, and
    /// the agent runs in a background task. Before the sentinel is forwarded
    /// the turn is ended, the request completed and the thread released.
    pub async fn submit(&self, request: TurnRequest) -> Result<RunHandle> {
        let TurnRequest {
            conversation_id,
            owner_id,
            model,
            system_prompt,
            messages,
        } = request;

        let started = self
            .store
            .start_request(conversation_id.as_deref(), &owner_id, &model)
            .await?;
        let conversation_id = started.conversation_id.clone();
        let ticket = self.dispatcher.dispatch(&conversation_id).await;

        match self.prepare(&conversation_id, &started.id, &model, messages).await {
            Ok((turn_id, timeline)) => {
                if !self
                    .dispatcher
                    .mark_running(&ticket.thread_id, &ticket.run_id)
                    .await
                {
                    debug!("Run {} superseded before it started", ticket.run_id);
                }
                Ok(self.launch(ticket, started.id, turn_id, model, system_prompt, timeline))
            }
            Err(e) => {
                warn!("Failed to prepare run {}: {}", ticket.run_id, e);
                self.dispatcher
                    .complete(&ticket.thread_id, &ticket.run_id)
                    .await;
                if let Err(e) = self.store.complete_request(&started.id).await {
                    warn!("Failed to complete request {}: {}", started.id, e);
                }
                Err(e)
            }
        }
    }

    /// Reconcile, persist the new messages and open the turn.
    async fn prepare(
        &self,
        conversation_id: &str,
        request_id: &str,
        model: &str,
        incoming: Vec<ChatMessage>,
    ) -> Result<(String, Vec<ChatMessage>)> {
        let history = self.store.history(conversation_id).await?;
        let mut timeline = self.reconciler.merge(&history, incoming);

        let stored: HashSet<&str> = history.iter().map(|r| r.id.as_str()).collect();
        let mut fresh = Vec::new();
        for message in &mut timeline {
            if message.id.is_none() {
                message.id = Some(Uuid::now_v7().to_string());
            }
            if message.id.as_deref().is_some_and(|id| !stored.contains(id)) {
                fresh.push(message.clone());
            }
        }
        let written = self.store.sync_history(conversation_id, &fresh).await?;
        debug!(
            "Conversation {}: {} stored, {} new, {} in timeline",
            conversation_id,
            history.len(),
            written.len(),
            timeline.len()
        );

        let turn = self
            .store
            .start_turn(conversation_id, request_id, model)
            .await?;
        Ok((turn.id, timeline))
    }

    fn launch(
        &self,
        ticket: RunTicket,
        request_id: String,
        turn_id: String,
        model: String,
        system_prompt: Option<String>,
        timeline: Vec<ChatMessage>,
    ) -> RunHandle {
        let ctx = TraceContext {
            conversation_id: ticket.thread_id.clone(),
            request_id: request_id.clone(),
            turn_id: turn_id.clone(),
        };

        let mut messages = Vec::with_capacity(timeline.len() + 1);
        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend(timeline);

        let recorder: Arc<dyn EventRecorder> = self.store.clone();
        let (sequencer, output) = EventSequencer::new(recorder, ctx, ticket.cancel.clone());
        sequencer.chain(agent_turn(AgentTurn {
            llm: self.llm.clone(),
            tools: self.tools.clone(),
            model,
            messages,
            inference_timeout: self.config.inference_timeout,
            max_tool_rounds: self.config.max_tool_rounds,
            cancel: ticket.cancel.clone(),
        }));
        sequencer.done();

        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));
        let handle = RunHandle {
            run_id: ticket.run_id.clone(),
            conversation_id: ticket.thread_id.clone(),
            request_id: request_id.clone(),
            turn_id: turn_id.clone(),
            strategy: ticket.strategy,
            events: receiver_stream(rx),
        };

        let finalizer = Finalizer {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            ticket,
            request_id,
            turn_id,
        };
        tokio::spawn(forward(output, tx, finalizer));

        info!(
            "Run {} launched for turn {} ({:?})",
            handle.run_id, handle.turn_id, handle.strategy
        );
        handle
    }
}

/// Pump sequencer output into the client channel, finalizing on the sentinel.
async fn forward(
    mut output: BoxStream<'static, RunEvent>,
    tx: mpsc::Sender<RunEvent>,
    finalizer: Finalizer,
) {
    let cancel: CancellationToken = finalizer.ticket.cancel.clone();
    let mut error_type = None;
    let mut client_gone = false;

    loop {
        let next = tokio::select! {
            event = output.next() => event,
            () = tx.closed(), if !client_gone => {
                debug!("Client dropped run {}", finalizer.ticket.run_id);
                client_gone = true;
                cancel.cancel();
                continue;
            }
        };
        let Some(event) = next else {
            break;
        };

        if let RunEvent::Error { error_type: kind, .. } = &event {
            error_type = Some(kind.clone());
        }

        if event.is_sentinel() {
            finalizer.finish(error_type.take()).await;
            if !client_gone {
                let _ = tx.send(event).await;
            }
            break;
        }

        if !client_gone && tx.send(event).await.is_err() {
            debug!("Client dropped run {}", finalizer.ticket.run_id);
            client_gone = true;
            cancel.cancel();
        }
    }
}

fn receiver_stream(mut rx: mpsc::Receiver<RunEvent>) -> BoxStream<'static, RunEvent> {
    Box::pin(async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    })
}

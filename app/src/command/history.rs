use tether_checkpoint::{CheckpointIndex, HistoryState};
use tether_config::Config;
use tether_conversation::{ConversationStore, MessageReconciler};
use tether_core::ChatMessage;
use tracing::info;

pub struct HistoryInput {
    pub config: Config,
    pub conversation_id: String,
    /// Checkpoint thread to look messages up in.
    pub thread_id: Option<String>,
}

/// Prints a conversation's reconciled timeline, optionally with the earliest
/// checkpoint each message appeared in.
#[derive(Debug, Clone, Copy)]
pub struct HistoryStrategy;

impl super::CommandStrategy for HistoryStrategy {
    type Input = HistoryInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let HistoryInput {
            config,
            conversation_id,
            thread_id,
        } = input;

        let kv = super::open_store(&config).await?;
        let store = ConversationStore::new(kv.clone());
        let conversation = store
            .get_conversation(&conversation_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Conversation {conversation_id} not found"))?;

        let reconciler = MessageReconciler::new(config.reconcile.clone());
        let timeline = reconciler
            .hydrate(&store, &conversation_id, Vec::new())
            .await?;
        info!(
            "Conversation {} has {} messages on its timeline",
            conversation_id,
            timeline.len()
        );

        let states = match thread_id {
            Some(thread_id) => {
                CheckpointIndex::new(kv)
                    .annotate(&thread_id, prefix_states(&timeline))
                    .await
            }
            None => prefix_states(&timeline),
        };

        println!(
            "Conversation {} ({:?}, indexing {}) owned by {}",
            conversation.id,
            conversation.status,
            conversation.indexing_status,
            conversation.owner_id
        );
        println!();
        for (position, state) in states.iter().enumerate() {
            if let Some(message) = state.messages.last() {
                println!("{}", render_line(position, message, state));
            }
        }

        Ok(())
    }
}

/// One state per message, each holding the timeline up to and including it.
fn prefix_states(timeline: &[ChatMessage]) -> Vec<HistoryState> {
    (1..=timeline.len())
        .map(|end| HistoryState::new(timeline[..end].to_vec()))
        .collect()
}

fn render_line(position: usize, message: &ChatMessage, state: &HistoryState) -> String {
    let mut line = format!(
        "[{position}] {}: {}",
        message.role,
        super::truncate(&message.content, 80)
    );
    if let Some(checkpoint) = &state.checkpoint {
        line.push_str(&format!(
            "  (checkpoint {}/{})",
            checkpoint.checkpoint_ns, checkpoint.checkpoint_id
        ));
    }
    line
}

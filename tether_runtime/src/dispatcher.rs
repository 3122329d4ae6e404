//! Per-thread run admission.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// How a new run relates to whatever was already running on its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    /// The thread was idle.
    Normal,
    /// The new run supersedes the active one.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    Busy { run_id: String, status: RunStatus },
}

struct RunSlot {
    run_id: String,
    status: RunStatus,
    cancel: CancellationToken,
}

/// Admission decision for one run.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub run_id: String,
    pub thread_id: String,
    pub strategy: MultitaskStrategy,
    /// The run this one interrupted.
    pub superseded: Option<String>,
    /// Cancelled when a later run interrupts this one.
    pub cancel: CancellationToken,
}

/// Tracks which run, if any, owns each thread.
///
/// A busy thread admits new runs by interrupting: the active run's token is
/// cancelled and the slot moves to the newcomer.
#[derive(Default)]
pub struct RunDispatcher {
    slots: Mutex<HashMap<String, RunSlot>>,
}

impl RunDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatch(&self, thread_id: &str) -> RunTicket {
        let run_id = Uuid::now_v7().to_string();
        let cancel = CancellationToken::new();

        let mut slots = self.slots.lock().await;
        let previous = slots.insert(
            thread_id.to_string(),
            RunSlot {
                run_id: run_id.clone(),
                status: RunStatus::Pending,
                cancel: cancel.clone(),
            },
        );
        drop(slots);

        let (strategy, superseded) = match previous {
            Some(slot) => {
                slot.cancel.cancel();
                info!(
                    "Run {} interrupts {:?} run {} on thread {}",
                    run_id, slot.status, slot.run_id, thread_id
                );
                (MultitaskStrategy::Interrupt, Some(slot.run_id))
            }
            None => {
                info!("Run {} started on idle thread {}", run_id, thread_id);
                (MultitaskStrategy::Normal, None)
            }
        };

        RunTicket {
            run_id,
            thread_id: thread_id.to_string(),
            strategy,
            superseded,
            cancel,
        }
    }

    /// Move `run_id` from pending to running. False if it no longer owns the thread.
    pub async fn mark_running(&self, thread_id: &str, run_id: &str) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(thread_id) {
            Some(slot) if slot.run_id == run_id => {
                slot.status = RunStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Release the thread if `run_id` still owns it.
    ///
    /// A superseded run finishing late leaves its successor's slot alone.
    pub async fn complete(&self, thread_id: &str, run_id: &str) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.get(thread_id).is_some_and(|slot| slot.run_id == run_id) {
            slots.remove(thread_id);
            debug!("Thread {} idle after run {}", thread_id, run_id);
            true
        } else {
            debug!("Run {} finished after being superseded on {}", run_id, thread_id);
            false
        }
    }

    pub async fn state(&self, thread_id: &str) -> ThreadState {
        self.slots
            .lock()
            .await
            .get(thread_id)
            .map_or(ThreadState::Idle, |slot| ThreadState::Busy {
                run_id: slot.run_id.clone(),
                status: slot.status,
            })
    }
}

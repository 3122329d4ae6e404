#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Resumable checkpoint identifiers and the message-to-checkpoint index.
//!
//! # Key layout
//! `checkpoint:{threadId}:{checkpointNamespace}:{checkpointId}`, each segment
//! escaped with `\` -> `\\` and `:` -> `\:`. The namespace may be empty.

mod codec;
mod error;
mod index;
mod saver;

pub use codec::{CHECKPOINT_NAMESPACE, CheckpointKey};
pub use error::{CheckpointError, Result};
pub use index::{CheckpointConfig, CheckpointIndex, CheckpointRef, HistoryState, annotate_states};
pub use saver::{Checkpoint, CheckpointSaver, StoredCheckpoint};

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

//! Conversation state: entity lifecycles, trace recording and history
//! reconciliation.
//!
//! [`ConversationStore`] is the only writer of conversations, requests and
//! turns. [`MessageReconciler`] reads its message history back and merges it
//! with what a client just submitted.

mod error;
mod reconcile;
mod recorder;
mod store;

pub use error::{ConversationError, Result};
pub use reconcile::{MessageReconciler, ReconcileConfig};
pub use recorder::Recorder;
pub use store::{ConversationStore, LLM_CALL_TRACE_TYPE, TraceRecord};

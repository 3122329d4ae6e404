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

//! Running turns against conversations.
//!
//! [`RunDispatcher`] decides whether a run starts cleanly or interrupts the
//! active one. [`EventSequencer`] turns the run's event sources into one
//! recorded stream that always ends with a sentinel. [`ConversationEngine`]
//! wires both to the conversation store and the agent turn.

mod dispatcher;
mod engine;
mod error;
mod run;
mod sequencer;
mod sse;

pub use dispatcher::{MultitaskStrategy, RunDispatcher, RunStatus, RunTicket, ThreadState};
pub use engine::{ConversationEngine, RunHandle, RuntimeConfig, TurnRequest};
pub use error::{Result, RuntimeError};
pub use run::{AgentTurn, agent_turn};
pub use sequencer::{CANCELLED_REASON, EventSequencer, EventSource};
pub use sse::{DONE_FRAME, sse_frame, sse_stream};

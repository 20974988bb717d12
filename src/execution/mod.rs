//! Flow Execution Module
//!
//! Runs operation flows and records what happened.
//!
//! - [`engine`]: Step sequencing, attribute threading and group continuations
//! - [`trace`]: Per-call record of executed steps

pub(crate) mod dispatch;
pub mod engine;
pub mod trace;

pub(crate) use dispatch::Mode;
pub use engine::{Continuation, FALSEY_ID, TRUTHY_ID, UNRESUMED_ID};
pub use trace::{EventType, ExecutionTrace, TraceEvent};

//! Core types for the weft workflow engine
//!
//! This crate holds the shared vocabulary of the engine: the event log
//! model, workflow and task rows, the error taxonomy, and the retry
//! backoff used by the dispatcher. It has no database or runtime
//! dependencies so every other crate can build on it.

pub mod error;
pub mod event;
pub mod log;
pub mod retry;
pub mod task;
pub mod workflow;

pub use error::{ErrorSource, ExtractedError, StepError, StepResult};
pub use event::{ActivityMetadata, EventKind, EventRecord, WorkflowEvent};
pub use log::{LogEntry, LogLevel};
pub use retry::retry_delay;
pub use task::{Task, TaskKind, TaskStatus};
pub use workflow::{FailureCause, NewWorkflow, WorkflowRow, WorkflowStatus};

/// Generate a new opaque id for workflows, tasks and timers.
///
/// UUID v7 keeps ids time-ordered, which keeps primary-key indexes compact.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

//! EventStore trait definition
//!
//! The engine talks to persistence exclusively through this trait. The
//! production implementation is [`SqliteStore`](crate::SqliteStore); the
//! [`MemoryStore`](crate::MemoryStore) mirrors its semantics for tests.
//! Every operation either fully commits or leaves no trace; callers treat
//! any store error as fatal to the current task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use weft_core::{
    ActivityMetadata, EventRecord, FailureCause, LogEntry, LogLevel, NewWorkflow, Task,
    WorkflowEvent, WorkflowRow, WorkflowStatus,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Append refused because the workflow already reached a terminal state
    #[error("workflow {0} is in terminal state {1}")]
    WorkflowTerminal(String, WorkflowStatus),

    /// Signal refused because the workflow is not running
    #[error("workflow {0} is not running (status {1})")]
    WorkflowNotRunning(String, WorkflowStatus),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Aggregate counts served to the CLI `stats` command
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Workflow counts keyed by status string
    pub workflows: Vec<(String, i64)>,
    /// Task counts keyed by status string
    pub tasks: Vec<(String, i64)>,
    pub events: i64,
    pub logs: i64,
}

/// Persistence surface for workflows, events, tasks and logs
///
/// Implementations must be safe under N concurrent workers: `claim_task`
/// is the contention point and must hand each PENDING task to exactly one
/// claimant.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a workflow in RUNNING, append `WORKFLOW_STARTED{input}` and
    /// enqueue the first STEP task, all in one transaction. Returns the id.
    async fn create_workflow(
        &self,
        workflow: &NewWorkflow,
        input: &Value,
    ) -> Result<String, StoreError>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowRow, StoreError>;

    async fn get_workflow_status(&self, workflow_id: &str)
        -> Result<WorkflowStatus, StoreError>;

    /// List workflows, newest first, optionally filtered by status.
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: i64,
    ) -> Result<Vec<WorkflowRow>, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Append one event; refused with [`StoreError::WorkflowTerminal`] once
    /// the workflow has a terminal status.
    async fn append_event(
        &self,
        workflow_id: &str,
        event: &WorkflowEvent,
    ) -> Result<(), StoreError>;

    /// Append several events in one transaction (state batches).
    async fn append_events(
        &self,
        workflow_id: &str,
        events: &[WorkflowEvent],
    ) -> Result<(), StoreError>;

    /// All events for a workflow, ascending by event id.
    async fn list_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError>;

    /// The N-th `ACTIVITY_SCHEDULED` event whose name matches, offset by
    /// `attempt - 1`. Retries reuse the same scheduled event, so for a
    /// healthy log every attempt of one logical call resolves to offset 0
    /// past the prior completed calls of the same name.
    async fn get_activity_event(
        &self,
        workflow_id: &str,
        activity_name: &str,
        attempt: i64,
    ) -> Result<Option<WorkflowEvent>, StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Atomically claim the oldest PENDING task with `run_at <= now`:
    /// set RUNNING, `attempts += 1`, return the row. Tie-break by
    /// `run_at ASC, created_at ASC`.
    async fn claim_task(&self) -> Result<Option<Task>, StoreError>;

    /// RUNNING -> COMPLETED. No-op when the task is not RUNNING.
    async fn complete_task(&self, task_id: &str) -> Result<(), StoreError>;

    /// RUNNING -> FAILED with the error recorded.
    async fn fail_task(&self, task_id: &str, error: &str) -> Result<(), StoreError>;

    /// RUNNING -> PENDING with `run_at` unchanged. Used when a claimed
    /// timer task is not due yet.
    async fn release_task(&self, task_id: &str) -> Result<(), StoreError>;

    /// RUNNING -> PENDING with a new `run_at` and the error recorded.
    async fn schedule_retry(
        &self,
        task_id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Complete the RUNNING STEP driver and enqueue a fresh PENDING one in
    /// one transaction. Idempotent: never leaves more than one live driver.
    async fn rotate_driver(&self, workflow_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Scheduling Operations (event + task in one transaction)
    // =========================================================================

    /// Append `ACTIVITY_SCHEDULED{metadata}` and insert the PENDING
    /// ACTIVITY task with `max_attempts = retry_count`.
    async fn create_activity(
        &self,
        workflow_id: &str,
        metadata: &ActivityMetadata,
    ) -> Result<(), StoreError>;

    /// Append `ACTIVITY_COMPLETED{name, result}`, complete the task and
    /// rotate the driver, all in one transaction.
    async fn complete_activity(
        &self,
        workflow_id: &str,
        task_id: &str,
        activity_name: &str,
        result: &Value,
    ) -> Result<(), StoreError>;

    /// Append `ACTIVITY_FAILED{name, error}`, fail the task and rotate
    /// the driver, all in one transaction, so the workflow's next tick
    /// observes the permanent failure. A crash can never strand the task
    /// RUNNING with the event recorded, or record the failure without a
    /// live driver to surface it.
    async fn fail_activity(
        &self,
        workflow_id: &str,
        task_id: &str,
        activity_name: &str,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Append `TIMER_SCHEDULED{timer_id, fire_at}` and insert the PENDING
    /// TIMER task with `run_at = fire_at`. Returns the timer id.
    async fn create_timer(
        &self,
        workflow_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<String, StoreError>;

    /// Append `TIMER_FIRED{timer_id}`, complete the timer task and rotate
    /// the driver, all in one transaction.
    async fn fire_timer(&self, workflow_id: &str, task_id: &str) -> Result<(), StoreError>;

    /// Append `SIGNAL_RECEIVED{name, payload, sent_at}` and rotate the
    /// driver so the workflow observes the signal on its next tick.
    /// Errors unless the workflow is RUNNING.
    async fn create_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: &Value,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Terminal Transitions
    // =========================================================================

    /// Append `WORKFLOW_COMPLETED`, set COMPLETED, complete the running
    /// driver. No-op when already terminal.
    async fn mark_completed(&self, workflow_id: &str) -> Result<(), StoreError>;

    /// Append `WORKFLOW_FAILED`, set FAILED, fail all PENDING tasks.
    /// No-op when already terminal.
    async fn mark_failed(
        &self,
        workflow_id: &str,
        error: &str,
        cause: FailureCause,
    ) -> Result<(), StoreError>;

    /// Append `WORKFLOW_CANCELLED`, set CANCELED, fail all PENDING tasks.
    /// No-op when already terminal.
    async fn mark_cancelled(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Best-effort log write; callers swallow errors.
    async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn list_logs(&self, workflow_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Generate a store-side id (workflows, tasks, timers).
pub(crate) fn new_row_id() -> String {
    weft_core::new_id()
}

//! Activity executor
//!
//! Runs one claimed ACTIVITY task: recover the recorded metadata and
//! arguments from the `ACTIVITY_SCHEDULED` event, resolve the handler in
//! the registry, and invoke it bounded by the activity's timeout. Success
//! writes the completion and rotates the driver in one transaction;
//! failure applies the retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use weft_core::{retry_delay, Task, WorkflowEvent};
use weft_store::{EventStore, StoreError};

use crate::registry::Registry;

pub struct ActivityExecutor {
    store: Arc<dyn EventStore>,
    registry: Arc<Registry>,
}

impl ActivityExecutor {
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Execute a claimed ACTIVITY task to its outcome.
    ///
    /// Store errors bubble up so the dispatcher can apply the task retry
    /// path; user-code failures are handled here.
    #[instrument(skip(self, task), fields(task_id = %task.id, activity = %task.target))]
    pub async fn execute(&self, task: &Task) -> Result<(), StoreError> {
        // Retries reuse the same scheduled event, so the current logical
        // call is the one past all already-completed calls of this name,
        // regardless of the task's attempt counter.
        let records = self.store.list_events(&task.workflow_id).await?;
        let completed_calls = records
            .iter()
            .filter(|r| {
                matches!(
                    &r.event,
                    WorkflowEvent::ActivityCompleted { name, .. } if *name == task.target
                )
            })
            .count() as i64;

        let event = self
            .store
            .get_activity_event(&task.workflow_id, &task.target, completed_calls + 1)
            .await?;

        let Some(WorkflowEvent::ActivityScheduled { metadata }) = event else {
            // The log must contain the scheduled event for every claimed
            // activity task; its absence means the history is corrupt.
            let message = format!(
                "no ACTIVITY_SCHEDULED event for activity '{}' (call {})",
                task.target,
                completed_calls + 1
            );
            warn!(%message);
            self.store.fail_task(&task.id, &message).await?;
            return Ok(());
        };

        let outcome = match self.registry.activity(&metadata.module, &metadata.name) {
            Ok(definition) => {
                let timeout = Duration::from_secs(metadata.timeout_seconds.max(1) as u64);
                match tokio::time::timeout(timeout, definition.run(metadata.args.clone())).await
                {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(format!(
                        "activity '{}' timed out after {}s",
                        metadata.name, metadata.timeout_seconds
                    )),
                }
            }
            Err(err) => Err(err.to_string()),
        };

        match outcome {
            Ok(result) => {
                self.store
                    .complete_activity(&task.workflow_id, &task.id, &metadata.name, &result)
                    .await?;
                debug!(activity = %metadata.name, "activity completed");
                Ok(())
            }
            Err(error) => self.handle_failure(task, &error).await,
        }
    }

    async fn handle_failure(&self, task: &Task, error: &str) -> Result<(), StoreError> {
        if task.has_attempts_remaining() {
            let delay = retry_delay(task.attempts);
            let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store.schedule_retry(&task.id, run_at, error).await?;
            debug!(
                task_id = %task.id,
                attempts = task.attempts,
                delay_secs = delay.as_secs(),
                "activity will retry"
            );
            return Ok(());
        }

        // Retries exhausted: record the permanent failure, fail the task
        // and wake the workflow in one transaction, so a crash can never
        // leave the event without a failed task or the failure without a
        // live driver to surface it.
        self.store
            .fail_activity(&task.workflow_id, &task.id, &task.target, error)
            .await?;

        warn!(
            workflow_id = %task.workflow_id,
            activity = %task.target,
            %error,
            "activity permanently failed"
        );
        Ok(())
    }
}

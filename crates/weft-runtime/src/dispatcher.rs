//! Task dispatcher
//!
//! Thin layer between the worker pool and the store: claims one task,
//! routes it by kind to the replay engine, the activity executor, or the
//! local timer handler, and converts outcomes into store calls. Store
//! errors are fatal to the current task only; the task retry path applies
//! when the task still has budget.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use weft_core::{retry_delay, FailureCause, Task, TaskKind};
use weft_store::{EventStore, StoreError};

use crate::engine::ReplayEngine;
use crate::executor::ActivityExecutor;
use crate::registry::Registry;

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    engine: ReplayEngine,
    executor: ActivityExecutor,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<Registry>) -> Self {
        Self {
            engine: ReplayEngine::new(store.clone(), registry.clone()),
            executor: ActivityExecutor::new(store.clone(), registry),
            store,
        }
    }

    /// Claim and process one task. Returns whether a task was claimed.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(task) = self.store.claim_task().await? else {
            return Ok(false);
        };

        // A tick against an already-terminal workflow exits quietly;
        // races with signals and rotations are benign.
        let status = self.store.get_workflow_status(&task.workflow_id).await?;
        if status.is_terminal() {
            self.store.complete_task(&task.id).await?;
            return Ok(true);
        }

        if let Err(err) = self.dispatch(&task).await {
            self.handle_task_error(&task, &err).await?;
        }

        Ok(true)
    }

    async fn dispatch(&self, task: &Task) -> Result<(), StoreError> {
        match task.kind {
            TaskKind::Step => {
                let outcome = self.engine.replay_until_block(&task.workflow_id).await?;
                debug!(task_id = %task.id, ?outcome, "tick finished");
                self.store.complete_task(&task.id).await
            }
            TaskKind::Activity => self.executor.execute(task).await,
            TaskKind::Timer => {
                // Some backends cannot filter run_at <= now precisely
                // enough at claim time; double-check before firing.
                if task.run_at > Utc::now() {
                    self.store.release_task(&task.id).await
                } else {
                    self.store.fire_timer(&task.workflow_id, &task.id).await
                }
            }
        }
    }

    async fn handle_task_error(&self, task: &Task, err: &StoreError) -> Result<(), StoreError> {
        let message = err.to_string();
        warn!(task_id = %task.id, kind = %task.kind, %message, "task processing failed");

        if task.has_attempts_remaining() {
            let delay = retry_delay(task.attempts);
            let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store.schedule_retry(&task.id, run_at, &message).await
        } else {
            self.store.fail_task(&task.id, &message).await?;
            self.store
                .mark_failed(
                    &task.workflow_id,
                    &message,
                    FailureCause::for_task(&task.id, task.kind),
                )
                .await
        }
    }
}

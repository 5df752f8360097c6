//! In-memory implementation of EventStore for testing
//!
//! Mirrors the SQLite store's semantics (terminal guards, driver
//! uniqueness, claim ordering) without a database, so runtime logic can be
//! unit-tested in isolation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use weft_core::{
    task::TIMER_TARGET, ActivityMetadata, EventRecord, FailureCause, LogEntry, LogLevel,
    NewWorkflow, Task, TaskKind, TaskStatus, WorkflowEvent, WorkflowRow, WorkflowStatus,
};

use crate::store::{new_row_id, EventStore, StoreError, StoreStats};

const DEFAULT_TASK_ATTEMPTS: i64 = 3;

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, WorkflowRow>,
    events: Vec<EventRecord>,
    tasks: HashMap<String, Task>,
    logs: Vec<LogEntry>,
    next_event_id: i64,
    next_log_id: i64,
}

impl Inner {
    fn workflow(&self, workflow_id: &str) -> Result<&WorkflowRow, StoreError> {
        self.workflows
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn push_event(&mut self, workflow_id: &str, event: WorkflowEvent, now: DateTime<Utc>) {
        self.next_event_id += 1;
        self.events.push(EventRecord {
            id: self.next_event_id,
            workflow_id: workflow_id.to_string(),
            event,
            created_at: now,
        });
    }

    fn push_task(
        &mut self,
        id: String,
        workflow_id: &str,
        kind: TaskKind,
        target: &str,
        run_at: DateTime<Utc>,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) {
        self.tasks.insert(
            id.clone(),
            Task {
                id,
                workflow_id: workflow_id.to_string(),
                kind,
                target: target.to_string(),
                run_at,
                status: TaskStatus::Pending,
                attempts: 0,
                max_attempts,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    fn complete_running_task(&mut self, task_id: &str, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Completed;
                task.updated_at = now;
            }
        }
    }

    fn fail_running_task(&mut self, task_id: &str, error: &str, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Failed;
                task.last_error = Some(error.to_string());
                task.updated_at = now;
            }
        }
    }

    fn rotate_driver(&mut self, workflow_id: &str, workflow_name: &str, now: DateTime<Utc>) {
        for task in self.tasks.values_mut() {
            if task.workflow_id == workflow_id
                && task.kind == TaskKind::Step
                && task.status == TaskStatus::Running
            {
                task.status = TaskStatus::Completed;
                task.updated_at = now;
            }
        }

        let has_pending = self.tasks.values().any(|t| {
            t.workflow_id == workflow_id
                && t.kind == TaskKind::Step
                && t.status == TaskStatus::Pending
        });

        if !has_pending {
            self.push_task(
                new_row_id(),
                workflow_id,
                TaskKind::Step,
                workflow_name,
                now,
                DEFAULT_TASK_ATTEMPTS,
                now,
            );
        }
    }

    fn set_status(&mut self, workflow_id: &str, status: WorkflowStatus, now: DateTime<Utc>) {
        if let Some(row) = self.workflows.get_mut(workflow_id) {
            row.status = status;
            row.updated_at = now;
        }
    }

    fn fail_pending_tasks(&mut self, workflow_id: &str, reason: &str, now: DateTime<Utc>) {
        for task in self.tasks.values_mut() {
            if task.workflow_id == workflow_id && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Failed;
                task.last_error = Some(reason.to_string());
                task.updated_at = now;
            }
        }
    }
}

/// In-memory store used by unit tests
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count tasks in a given status (test assertions)
    pub fn task_count(&self, status: TaskStatus) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    /// Snapshot of all tasks for a workflow (test assertions)
    pub fn tasks_for(&self, workflow_id: &str) -> Vec<Task> {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    /// Make every PENDING task immediately claimable (test clock control,
    /// avoids sleeping through real retry backoffs)
    pub fn make_pending_due(&self) {
        let now = Utc::now() - chrono::Duration::seconds(1);
        for task in self.inner.write().tasks.values_mut() {
            if task.status == TaskStatus::Pending && task.run_at > now {
                task.run_at = now;
            }
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_workflow(
        &self,
        workflow: &NewWorkflow,
        input: &Value,
    ) -> Result<String, StoreError> {
        let workflow_id = new_row_id();
        let now = Utc::now();
        let mut inner = self.inner.write();

        inner.workflows.insert(
            workflow_id.clone(),
            WorkflowRow {
                id: workflow_id.clone(),
                name: workflow.name.clone(),
                description: workflow.description.clone(),
                version: workflow.version.clone(),
                status: WorkflowStatus::Running,
                module: workflow.module.clone(),
                input: input.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        inner.push_event(
            &workflow_id,
            WorkflowEvent::WorkflowStarted {
                input: input.clone(),
            },
            now,
        );
        let name = workflow.name.clone();
        inner.push_task(
            new_row_id(),
            &workflow_id,
            TaskKind::Step,
            &name,
            now,
            DEFAULT_TASK_ATTEMPTS,
            now,
        );

        Ok(workflow_id)
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowRow, StoreError> {
        self.inner.read().workflow(workflow_id).cloned()
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, StoreError> {
        Ok(self.inner.read().workflow(workflow_id)?.status)
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: i64,
    ) -> Result<Vec<WorkflowRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkflowRow> = inner
            .workflows
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn append_event(
        &self,
        workflow_id: &str,
        event: &WorkflowEvent,
    ) -> Result<(), StoreError> {
        self.append_events(workflow_id, std::slice::from_ref(event))
            .await
    }

    async fn append_events(
        &self,
        workflow_id: &str,
        events: &[WorkflowEvent],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let status = inner.workflow(workflow_id)?.status;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(
                workflow_id.to_string(),
                status,
            ));
        }

        for event in events {
            inner.push_event(workflow_id, event.clone(), now);
        }
        Ok(())
    }

    async fn list_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_activity_event(
        &self,
        workflow_id: &str,
        activity_name: &str,
        attempt: i64,
    ) -> Result<Option<WorkflowEvent>, StoreError> {
        let offset = (attempt - 1).max(0) as usize;
        Ok(self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| {
                e.workflow_id == workflow_id
                    && matches!(
                        &e.event,
                        WorkflowEvent::ActivityScheduled { metadata } if metadata.name == activity_name
                    )
            })
            .nth(offset)
            .map(|e| e.event.clone()))
    }

    async fn claim_task(&self) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let candidate = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.run_at <= now)
            .min_by(|a, b| {
                a.run_at
                    .cmp(&b.run_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|t| t.id.clone());

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        match inner.tasks.get_mut(&task_id) {
            Some(task) => {
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.updated_at = now;
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        self.inner.write().complete_running_task(task_id, Utc::now());
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .fail_running_task(task_id, error, Utc::now());
        Ok(())
    }

    async fn release_task(&self, task_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        task_id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Pending;
        task.run_at = run_at;
        task.last_error = Some(error.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn rotate_driver(&self, workflow_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let name = inner.workflow(workflow_id)?.name.clone();
        inner.rotate_driver(workflow_id, &name, now);
        Ok(())
    }

    async fn create_activity(
        &self,
        workflow_id: &str,
        metadata: &ActivityMetadata,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let status = inner.workflow(workflow_id)?.status;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(
                workflow_id.to_string(),
                status,
            ));
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::ActivityScheduled {
                metadata: metadata.clone(),
            },
            now,
        );
        let name = metadata.name.clone();
        inner.push_task(
            new_row_id(),
            workflow_id,
            TaskKind::Activity,
            &name,
            now,
            metadata.retry_count,
            now,
        );
        Ok(())
    }

    async fn complete_activity(
        &self,
        workflow_id: &str,
        task_id: &str,
        activity_name: &str,
        result: &Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let row = inner.workflow(workflow_id)?;
        let name = row.name.clone();
        let status = row.status;

        if status.is_terminal() {
            inner.complete_running_task(task_id, now);
            return Ok(());
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::ActivityCompleted {
                name: activity_name.to_string(),
                result: result.clone(),
            },
            now,
        );
        inner.complete_running_task(task_id, now);
        inner.rotate_driver(workflow_id, &name, now);
        Ok(())
    }

    async fn fail_activity(
        &self,
        workflow_id: &str,
        task_id: &str,
        activity_name: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let row = inner.workflow(workflow_id)?;
        let name = row.name.clone();
        let status = row.status;

        if status.is_terminal() {
            inner.fail_running_task(task_id, error, now);
            return Ok(());
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::ActivityFailed {
                name: activity_name.to_string(),
                error: error.to_string(),
            },
            now,
        );
        inner.fail_running_task(task_id, error, now);
        inner.rotate_driver(workflow_id, &name, now);
        Ok(())
    }

    async fn create_timer(
        &self,
        workflow_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let timer_id = new_row_id();
        let now = Utc::now();
        let mut inner = self.inner.write();

        let status = inner.workflow(workflow_id)?.status;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(
                workflow_id.to_string(),
                status,
            ));
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::TimerScheduled {
                timer_id: timer_id.clone(),
                fire_at,
            },
            now,
        );
        inner.push_task(
            timer_id.clone(),
            workflow_id,
            TaskKind::Timer,
            TIMER_TARGET,
            fire_at,
            DEFAULT_TASK_ATTEMPTS,
            now,
        );
        Ok(timer_id)
    }

    async fn fire_timer(&self, workflow_id: &str, task_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let row = inner.workflow(workflow_id)?;
        let name = row.name.clone();
        let status = row.status;

        if status.is_terminal() {
            inner.complete_running_task(task_id, now);
            return Ok(());
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::TimerFired {
                timer_id: task_id.to_string(),
            },
            now,
        );
        inner.complete_running_task(task_id, now);
        inner.rotate_driver(workflow_id, &name, now);
        Ok(())
    }

    async fn create_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let row = inner.workflow(workflow_id)?;
        let workflow_name = row.name.clone();
        let status = row.status;

        if status != WorkflowStatus::Running {
            return Err(StoreError::WorkflowNotRunning(
                workflow_id.to_string(),
                status,
            ));
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::SignalReceived {
                name: name.to_string(),
                payload: payload.clone(),
                sent_at: now,
            },
            now,
        );
        inner.rotate_driver(workflow_id, &workflow_name, now);
        Ok(())
    }

    async fn mark_completed(&self, workflow_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if inner.workflow(workflow_id)?.status.is_terminal() {
            return Ok(());
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::WorkflowCompleted { completed_at: now },
            now,
        );
        inner.set_status(workflow_id, WorkflowStatus::Completed, now);
        for task in inner.tasks.values_mut() {
            if task.workflow_id == workflow_id
                && task.kind == TaskKind::Step
                && task.status == TaskStatus::Running
            {
                task.status = TaskStatus::Completed;
                task.updated_at = now;
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        workflow_id: &str,
        error: &str,
        cause: FailureCause,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if inner.workflow(workflow_id)?.status.is_terminal() {
            return Ok(());
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::WorkflowFailed {
                error: error.to_string(),
                task_id: cause.task_id,
                task_kind: cause.task_kind.map(|kind| kind.as_str().to_string()),
                activity: cause.activity,
                failed_at: now,
            },
            now,
        );
        inner.set_status(workflow_id, WorkflowStatus::Failed, now);
        inner.fail_pending_tasks(workflow_id, "workflow failed", now);
        Ok(())
    }

    async fn mark_cancelled(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if inner.workflow(workflow_id)?.status.is_terminal() {
            return Ok(());
        }

        inner.push_event(
            workflow_id,
            WorkflowEvent::WorkflowCancelled {
                reason: reason.to_string(),
                cancelled_at: now,
            },
            now,
        );
        inner.set_status(workflow_id, WorkflowStatus::Canceled, now);
        inner.fail_pending_tasks(workflow_id, "workflow cancelled", now);
        Ok(())
    }

    async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.next_log_id += 1;
        let entry = LogEntry {
            id: inner.next_log_id,
            workflow_id: workflow_id.to_string(),
            level: level.as_str().to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        };
        inner.logs.push(entry);
        Ok(())
    }

    async fn list_logs(&self, workflow_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .filter(|l| l.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.inner.read();
        let mut workflows: HashMap<String, i64> = HashMap::new();
        for row in inner.workflows.values() {
            *workflows.entry(row.status.as_str().to_string()).or_default() += 1;
        }
        let mut tasks: HashMap<String, i64> = HashMap::new();
        for task in inner.tasks.values() {
            *tasks.entry(task.status.as_str().to_string()).or_default() += 1;
        }
        Ok(StoreStats {
            workflows: workflows.into_iter().collect(),
            tasks: tasks.into_iter().collect(),
            events: inner.events.len() as i64,
            logs: inner.logs.len() as i64,
        })
    }
}

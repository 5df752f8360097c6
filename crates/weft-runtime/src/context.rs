//! Workflow execution context
//!
//! The context is the per-tick view of a workflow: the immutable input,
//! the event history with a replay cursor, and the in-memory state map.
//! Every decision point follows the same protocol:
//!
//! 1. skip `STEP_START`/`STEP_END` markers at the cursor,
//! 2. match-and-consume the expected event (and its paired completion),
//! 3. at end-of-history, persist the new scheduling event and suspend;
//!    any other event at the cursor is a non-determinism error.
//!
//! Suspension travels as [`StepError::Suspend`] through `?`; it is the
//! signal that this tick has done all the work history justifies.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use weft_core::{EventKind, LogLevel, StepError, StepResult, WorkflowEvent};
use weft_store::EventStore;

use crate::definition::ActivityDefinition;

/// Per-tick execution context handed to workflow steps
pub struct WorkflowContext {
    workflow_id: String,
    input: Value,
    history: Vec<WorkflowEvent>,
    cursor: usize,
    original_len: usize,
    state: serde_json::Map<String, Value>,
    batch: Option<Vec<WorkflowEvent>>,
    last_appended: Option<EventKind>,
    store: Arc<dyn EventStore>,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: String,
        input: Value,
        history: Vec<WorkflowEvent>,
        state: serde_json::Map<String, Value>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let original_len = history.len();
        Self {
            workflow_id,
            input,
            history,
            cursor: 0,
            original_len,
            state,
            batch: None,
            last_appended: None,
            store,
        }
    }

    /// The workflow's unique id.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The immutable input recorded at start.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Deserialize the input into a concrete type.
    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> StepResult<T> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| StepError::Failed(anyhow::anyhow!("invalid workflow input: {e}")))
    }

    /// True while historical events are still being consumed. Live logging
    /// is suppressed during replay.
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.original_len
    }

    /// Access the workflow state map.
    pub fn state(&mut self) -> StateHandle<'_> {
        StateHandle { ctx: self }
    }

    /// Workflow-scoped diagnostic logger.
    pub fn logger(&self) -> WorkflowLogger<'_> {
        WorkflowLogger { ctx: self }
    }

    // =========================================================================
    // Replay cursor
    // =========================================================================

    pub(crate) fn peek(&self) -> Option<&WorkflowEvent> {
        self.history.get(self.cursor)
    }

    pub(crate) fn consume(&mut self) {
        if self.cursor < self.history.len() {
            self.cursor += 1;
        }
    }

    /// Advance over STEP_START/STEP_END markers; they bracket steps and
    /// never carry a decision.
    pub(crate) fn skip_step_markers(&mut self) {
        while let Some(event) = self.peek() {
            if event.kind().is_step_marker() {
                self.cursor += 1;
            } else {
                break;
            }
        }
    }

    /// The kind of the last event appended live during this tick.
    pub(crate) fn last_appended(&self) -> Option<EventKind> {
        self.last_appended
    }

    /// Persist an event and mirror it into the local history.
    pub(crate) async fn append_live(&mut self, event: WorkflowEvent) -> StepResult<()> {
        self.store
            .append_event(&self.workflow_id, &event)
            .await
            .map_err(|e| StepError::Store(e.to_string()))?;
        self.last_appended = Some(event.kind());
        self.history.push(event);
        Ok(())
    }

    // =========================================================================
    // Decision points
    // =========================================================================

    /// Invoke an activity, returning its recorded result.
    ///
    /// On replay the scheduled event and its completion are consumed from
    /// history; live, the activity is scheduled and the tick suspends until
    /// a worker completes it.
    pub async fn activity(
        &mut self,
        definition: &ActivityDefinition,
        args: Vec<Value>,
    ) -> StepResult<Value> {
        let metadata = definition.metadata(args);

        self.skip_step_markers();
        match self.peek() {
            Some(WorkflowEvent::ActivityScheduled { metadata: recorded }) => {
                if recorded.name != metadata.name {
                    return Err(StepError::NonDeterministic(format!(
                        "expected activity '{}', found '{}' in history",
                        metadata.name, recorded.name
                    )));
                }
                self.consume();

                self.skip_step_markers();
                match self.peek() {
                    Some(WorkflowEvent::ActivityCompleted { name, result }) => {
                        if *name != metadata.name {
                            return Err(StepError::NonDeterministic(format!(
                                "expected completion of activity '{}', found '{}'",
                                metadata.name, name
                            )));
                        }
                        let result = result.clone();
                        self.consume();
                        Ok(result)
                    }
                    Some(WorkflowEvent::ActivityFailed { name, error }) => {
                        let err = StepError::ActivityFailed {
                            activity: name.clone(),
                            message: error.clone(),
                        };
                        self.consume();
                        Err(err)
                    }
                    // Completion has not arrived yet; the activity task
                    // will rotate the driver when it does.
                    _ => Err(StepError::Suspend),
                }
            }
            Some(other) => Err(StepError::NonDeterministic(format!(
                "code wants to schedule activity '{}', but history contains {}",
                metadata.name,
                other.kind()
            ))),
            None => {
                self.store
                    .create_activity(&self.workflow_id, &metadata)
                    .await
                    .map_err(|e| StepError::Store(e.to_string()))?;
                self.last_appended = Some(EventKind::ActivityScheduled);
                self.history
                    .push(WorkflowEvent::ActivityScheduled { metadata });
                Err(StepError::Suspend)
            }
        }
    }

    /// Sleep for a duration.
    pub async fn sleep(&mut self, delay: std::time::Duration) -> StepResult<()> {
        let delta = Duration::from_std(delay)
            .map_err(|e| StepError::Failed(anyhow::anyhow!("sleep duration out of range: {e}")))?;
        self.sleep_until(Utc::now() + delta).await
    }

    /// Sleep until an absolute time.
    pub async fn sleep_until(&mut self, fire_at: DateTime<Utc>) -> StepResult<()> {
        self.skip_step_markers();
        match self.peek() {
            Some(WorkflowEvent::TimerScheduled { .. }) => {
                self.consume();

                self.skip_step_markers();
                match self.peek() {
                    Some(WorkflowEvent::TimerFired { .. }) => {
                        self.consume();
                        Ok(())
                    }
                    // Timer has not fired yet; the timer task rotates the
                    // driver when the fire time is reached.
                    _ => Err(StepError::Suspend),
                }
            }
            Some(other) => Err(StepError::NonDeterministic(format!(
                "code wants to sleep, but history contains {}",
                other.kind()
            ))),
            None => {
                let timer_id = self
                    .store
                    .create_timer(&self.workflow_id, fire_at)
                    .await
                    .map_err(|e| StepError::Store(e.to_string()))?;
                self.last_appended = Some(EventKind::TimerScheduled);
                self.history
                    .push(WorkflowEvent::TimerScheduled { timer_id, fire_at });
                Err(StepError::Suspend)
            }
        }
    }

    /// Block until a signal with the given name arrives, returning its
    /// payload.
    pub async fn wait_until_signal(&mut self, signal_name: &str) -> StepResult<Value> {
        self.skip_step_markers();
        match self.peek() {
            Some(WorkflowEvent::SignalReceived { name, payload, .. }) => {
                if name != signal_name {
                    return Err(StepError::NonDeterministic(format!(
                        "expected signal '{signal_name}', but history contains signal '{name}'"
                    )));
                }
                let payload = payload.clone();
                self.consume();
                Ok(payload)
            }
            Some(other) => Err(StepError::NonDeterministic(format!(
                "workflow expecting signal '{signal_name}', but history contains {}",
                other.kind()
            ))),
            None => {
                self.logger()
                    .info(&format!("waiting for signal: {signal_name}"))
                    .await;
                Err(StepError::Suspend)
            }
        }
    }

    // =========================================================================
    // State internals (called through StateHandle / BatchScope)
    // =========================================================================

    fn state_set_replay(&mut self, key: &str) -> StepResult<Option<()>> {
        self.skip_step_markers();
        match self.peek() {
            Some(WorkflowEvent::StateSet { key: recorded, .. }) => {
                if recorded != key {
                    return Err(StepError::NonDeterministic(format!(
                        "expected STATE_SET of '{key}', found '{recorded}'"
                    )));
                }
                self.consume();
                Ok(Some(()))
            }
            Some(other) => Err(StepError::NonDeterministic(format!(
                "code wants to set state key '{key}', but history contains {}",
                other.kind()
            ))),
            None => Ok(None),
        }
    }

    fn state_update_replay(&mut self) -> StepResult<Option<()>> {
        self.skip_step_markers();
        match self.peek() {
            Some(WorkflowEvent::StateUpdate { .. }) => {
                self.consume();
                Ok(Some(()))
            }
            Some(other) => Err(StepError::NonDeterministic(format!(
                "code wants to update state, but history contains {}",
                other.kind()
            ))),
            None => Ok(None),
        }
    }
}

/// Read and write workflow state through the event log
///
/// Reads are served from the in-memory map rebuilt at the top of each
/// tick; writes emit `STATE_SET`/`STATE_UPDATE` events and suspend so a
/// fresh replay incorporates them.
pub struct StateHandle<'a> {
    ctx: &'a mut WorkflowContext,
}

impl StateHandle<'_> {
    /// Read a key from the in-memory map. Never consults history directly.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.ctx.state.get(key).cloned()
    }

    /// Read a key, falling back to a default.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.ctx.state.get(key).cloned().unwrap_or(default)
    }

    /// A snapshot of the whole state map.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.ctx.state.clone()
    }

    /// Write one key. Emits `STATE_SET` and suspends; on re-execution the
    /// recorded event is consumed without re-emitting.
    pub async fn set(&mut self, key: &str, value: Value) -> StepResult<()> {
        if self.ctx.state_set_replay(key)?.is_some() {
            return Ok(());
        }

        let event = WorkflowEvent::StateSet {
            key: key.to_string(),
            value,
        };
        self.ctx.append_live(event).await?;
        Err(StepError::Suspend)
    }

    /// Compute new values from the current map and write them as one
    /// `STATE_UPDATE{values}` event. The closure runs on first execution
    /// only; replay consumes the recorded event instead.
    pub async fn update<F>(&mut self, f: F) -> StepResult<()>
    where
        F: FnOnce(&serde_json::Map<String, Value>) -> serde_json::Map<String, Value>,
    {
        if self.ctx.state_update_replay()?.is_some() {
            return Ok(());
        }

        let values = f(&self.ctx.state);
        let event = WorkflowEvent::StateUpdate { values };
        self.ctx.append_live(event).await?;
        Err(StepError::Suspend)
    }

    /// Accumulate state writes and append them in one transaction.
    ///
    /// Inside the scope, `set`/`update` buffer their events instead of
    /// emitting them individually. On exit, a scope that wrote anything
    /// appends the whole buffer atomically and suspends; a fully-replayed
    /// scope continues without suspending. Nested batches are rejected.
    pub async fn batch<F>(&mut self, f: F) -> StepResult<()>
    where
        F: FnOnce(&mut BatchScope<'_>) -> StepResult<()>,
    {
        if self.ctx.batch.is_some() {
            return Err(StepError::Failed(anyhow::anyhow!(
                "nested state batches are not supported"
            )));
        }
        self.ctx.batch = Some(Vec::new());

        let result = f(&mut BatchScope {
            ctx: &mut *self.ctx,
        });
        let buffered = self.ctx.batch.take().unwrap_or_default();
        result?;

        if buffered.is_empty() {
            return Ok(());
        }

        self.ctx
            .store
            .append_events(self.ctx.workflow_id(), &buffered)
            .await
            .map_err(|e| StepError::Store(e.to_string()))?;
        for event in buffered {
            self.ctx.last_appended = Some(event.kind());
            self.ctx.history.push(event);
        }
        Err(StepError::Suspend)
    }
}

/// State operations inside a batch scope
///
/// These are synchronous: a batched write either consumes its replay
/// match or buffers the event; nothing touches the store until the scope
/// exits.
pub struct BatchScope<'a> {
    ctx: &'a mut WorkflowContext,
}

impl BatchScope<'_> {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.ctx.state.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: Value) -> StepResult<()> {
        if self.ctx.state_set_replay(key)?.is_some() {
            return Ok(());
        }

        let event = WorkflowEvent::StateSet {
            key: key.to_string(),
            value,
        };
        self.ctx
            .batch
            .as_mut()
            .expect("batch scope active")
            .push(event);
        Ok(())
    }

    pub fn update<F>(&mut self, f: F) -> StepResult<()>
    where
        F: FnOnce(&serde_json::Map<String, Value>) -> serde_json::Map<String, Value>,
    {
        if self.ctx.state_update_replay()?.is_some() {
            return Ok(());
        }

        let values = f(&self.ctx.state);
        self.ctx
            .batch
            .as_mut()
            .expect("batch scope active")
            .push(WorkflowEvent::StateUpdate { values });
        Ok(())
    }
}

/// Diagnostic logger scoped to one workflow
///
/// Suppressed during replay so a workflow's log reflects live execution
/// only. Database writes are best-effort; a logging failure never crashes
/// the workflow.
pub struct WorkflowLogger<'a> {
    ctx: &'a WorkflowContext,
}

impl WorkflowLogger<'_> {
    pub async fn info(&self, message: &str) {
        self.write(LogLevel::Info, message).await;
    }

    pub async fn warning(&self, message: &str) {
        self.write(LogLevel::Warning, message).await;
    }

    pub async fn error(&self, message: &str) {
        self.write(LogLevel::Error, message).await;
    }

    pub async fn debug(&self, message: &str) {
        self.write(LogLevel::Debug, message).await;
    }

    async fn write(&self, level: LogLevel, message: &str) {
        if self.ctx.is_replaying() {
            return;
        }

        let workflow_id = self.ctx.workflow_id();
        match level {
            LogLevel::Debug => debug!(%workflow_id, "{message}"),
            LogLevel::Info => info!(%workflow_id, "{message}"),
            LogLevel::Warning => warn!(%workflow_id, "{message}"),
            LogLevel::Error => error!(%workflow_id, "{message}"),
        }

        if let Err(err) = self.ctx.store.append_log(workflow_id, level, message).await {
            debug!(%workflow_id, "log write failed: {err}");
        }
    }
}

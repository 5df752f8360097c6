//! Client-side workflow handle
//!
//! A handle references a workflow by id and exposes status, metadata,
//! signalling, cancellation and result recovery. `result()` never reads a
//! materialized state row: it folds the workflow's own event log, which
//! is the authoritative record.

use std::sync::Arc;

use serde_json::Value;

use weft_core::{
    event::fold_state, ErrorSource, EventRecord, ExtractedError, LogEntry, WorkflowEvent,
    WorkflowRow, WorkflowStatus,
};
use weft_store::{EventStore, StoreError};

/// Errors surfaced by handle operations
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {0} is still running; result is not available")]
    StillRunning(String),

    #[error(transparent)]
    Failed(ExtractedError),

    #[error("workflow {0} was canceled; no result is available")]
    Canceled(String),

    #[error("workflow {0} is not running (status {1})")]
    NotRunning(String, WorkflowStatus),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for HandleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => HandleError::NotFound(id),
            StoreError::WorkflowNotRunning(id, status) => HandleError::NotRunning(id, status),
            other => HandleError::Store(other),
        }
    }
}

/// Handle for managing one workflow instance
#[derive(Clone)]
pub struct WorkflowHandle {
    store: Arc<dyn EventStore>,
    id: String,
}

impl WorkflowHandle {
    pub(crate) fn new(store: Arc<dyn EventStore>, id: String) -> Self {
        Self { store, id }
    }

    /// Reattach to an existing workflow by id.
    pub fn with_id(store: Arc<dyn EventStore>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> Result<WorkflowStatus, HandleError> {
        Ok(self.store.get_workflow_status(&self.id).await?)
    }

    /// Metadata plus timestamps.
    pub async fn info(&self) -> Result<WorkflowRow, HandleError> {
        Ok(self.store.get_workflow(&self.id).await?)
    }

    /// Send a signal; errors unless the workflow is RUNNING.
    pub async fn signal(&self, name: &str, payload: Value) -> Result<(), HandleError> {
        if name.is_empty() {
            return Err(HandleError::InvalidSignal(
                "signal name must be a non-empty string".into(),
            ));
        }
        Ok(self.store.create_signal(&self.id, name, &payload).await?)
    }

    /// Request cancellation; pending tasks are failed and the workflow is
    /// moved to CANCELED.
    pub async fn cancel(&self, reason: &str) -> Result<(), HandleError> {
        Ok(self.store.mark_cancelled(&self.id, reason).await?)
    }

    /// The terminal state map, folded from STATE_SET/STATE_UPDATE events.
    ///
    /// Fails with `StillRunning` before a terminal state, with the
    /// extracted failure when FAILED, and with `Canceled` when CANCELED.
    pub async fn result(&self) -> Result<serde_json::Map<String, Value>, HandleError> {
        let status = self.store.get_workflow_status(&self.id).await?;
        if status == WorkflowStatus::Running {
            return Err(HandleError::StillRunning(self.id.clone()));
        }

        let records = self.store.list_events(&self.id).await?;
        let events: Vec<WorkflowEvent> = records.into_iter().map(|r| r.event).collect();

        match status {
            WorkflowStatus::Failed => Err(HandleError::Failed(extract_error(&events))),
            WorkflowStatus::Canceled => Err(HandleError::Canceled(self.id.clone())),
            _ => Ok(fold_state(&events)),
        }
    }

    /// The raw event log (CLI inspection).
    pub async fn events(&self) -> Result<Vec<EventRecord>, HandleError> {
        Ok(self.store.list_events(&self.id).await?)
    }

    /// Diagnostic log entries.
    pub async fn logs(&self) -> Result<Vec<LogEntry>, HandleError> {
        Ok(self.store.list_logs(&self.id).await?)
    }
}

/// Extract the most relevant failure from a workflow's events.
///
/// Prefers the last `WORKFLOW_FAILED` payload (surfacing its activity
/// context when present), then the last `ACTIVITY_FAILED`, then a generic
/// fallback. Never fails.
pub(crate) fn extract_error(events: &[WorkflowEvent]) -> ExtractedError {
    let mut last_workflow_failure: Option<&WorkflowEvent> = None;
    let mut last_activity_failure: Option<(&str, &str)> = None;

    for event in events {
        match event {
            WorkflowEvent::WorkflowFailed { .. } => last_workflow_failure = Some(event),
            WorkflowEvent::ActivityFailed { name, error } => {
                last_activity_failure = Some((name, error))
            }
            _ => {}
        }
    }

    if let Some(WorkflowEvent::WorkflowFailed {
        error, activity, ..
    }) = last_workflow_failure
    {
        let details = serde_json::to_value(last_workflow_failure).unwrap_or(Value::Null);
        return match activity {
            Some(name) => ExtractedError {
                source: ErrorSource::Activity,
                message: error.clone(),
                activity: Some(name.clone()),
                details,
            },
            None => ExtractedError {
                source: ErrorSource::Workflow,
                message: error.clone(),
                activity: None,
                details,
            },
        };
    }

    if let Some((name, error)) = last_activity_failure {
        return ExtractedError {
            source: ErrorSource::Activity,
            message: error.to_string(),
            activity: Some(name.to_string()),
            details: Value::Null,
        };
    }

    ExtractedError {
        source: ErrorSource::Workflow,
        message: "workflow failed for unknown reasons".to_string(),
        activity: None,
        details: Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_extract_prefers_workflow_failure() {
        let events = vec![
            WorkflowEvent::ActivityFailed {
                name: "charge".into(),
                error: "card declined".into(),
            },
            WorkflowEvent::WorkflowFailed {
                error: "step blew up".into(),
                task_id: None,
                task_kind: None,
                activity: None,
                failed_at: Utc::now(),
            },
        ];

        let extracted = extract_error(&events);
        assert_eq!(extracted.source, ErrorSource::Workflow);
        assert_eq!(extracted.message, "step blew up");
    }

    #[test]
    fn test_extract_surfaces_activity_cause() {
        let events = vec![
            WorkflowEvent::ActivityFailed {
                name: "charge".into(),
                error: "card declined".into(),
            },
            WorkflowEvent::WorkflowFailed {
                error: "card declined".into(),
                task_id: None,
                task_kind: None,
                activity: Some("charge".into()),
                failed_at: Utc::now(),
            },
        ];

        let extracted = extract_error(&events);
        assert_eq!(extracted.source, ErrorSource::Activity);
        assert_eq!(extracted.activity.as_deref(), Some("charge"));
        assert_eq!(extracted.message, "card declined");
    }

    #[test]
    fn test_extract_falls_back_to_activity_failure() {
        let events = vec![WorkflowEvent::ActivityFailed {
            name: "send_email".into(),
            error: "smtp unreachable".into(),
        }];

        let extracted = extract_error(&events);
        assert_eq!(extracted.source, ErrorSource::Activity);
        assert_eq!(extracted.activity.as_deref(), Some("send_email"));
    }

    #[test]
    fn test_extract_generic_fallback() {
        let extracted = extract_error(&[]);
        assert_eq!(extracted.source, ErrorSource::Workflow);
        assert!(extracted.message.contains("unknown reasons"));
    }
}

//! Error taxonomy for workflow execution

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type for workflow step code.
pub type StepResult<T> = Result<T, StepError>;

/// Errors raised from inside a workflow tick
///
/// `Suspend` is not a failure: it is the internal signal that the tick has
/// done all the work history justifies and must wait for an external event.
/// User step code propagates it with `?` and never constructs it directly.
#[derive(Debug, Error)]
pub enum StepError {
    /// The tick has no more history-justified work; wait for an external
    /// event (activity completion, timer fire, signal arrival)
    #[error("workflow suspended awaiting external progress")]
    Suspend,

    /// History disagrees with what the code is requesting at a decision
    /// point; the workflow is marked FAILED and never auto-repaired
    #[error("non-deterministic workflow: {0}")]
    NonDeterministic(String),

    /// An activity exhausted its retries; fatal to the workflow
    #[error("activity '{activity}' failed: {message}")]
    ActivityFailed { activity: String, message: String },

    /// A store operation failed mid-tick; fatal to the current task, the
    /// task retry path applies
    #[error("store error: {0}")]
    Store(String),

    /// Any other error raised from user step code; fatal to the workflow
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Where an extracted failure originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSource {
    Workflow,
    Activity,
}

/// The most relevant failure recovered from a workflow's event log
///
/// Extraction prefers the last `WORKFLOW_FAILED` payload, then the last
/// `ACTIVITY_FAILED`, then a generic fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedError {
    pub source: ErrorSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl std::fmt::Display for ExtractedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.source, &self.activity) {
            (ErrorSource::Activity, Some(name)) => {
                write!(f, "activity '{}' failed: {}", name, self.message)
            }
            _ => write!(f, "workflow failed: {}", self.message),
        }
    }
}

impl std::error::Error for ExtractedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_display() {
        let err = StepError::NonDeterministic("expected activity 'a', found TIMER_FIRED".into());
        assert!(err.to_string().contains("non-deterministic"));

        let err = StepError::ActivityFailed {
            activity: "send_email".into(),
            message: "smtp unreachable".into(),
        };
        assert_eq!(
            err.to_string(),
            "activity 'send_email' failed: smtp unreachable"
        );
    }

    #[test]
    fn test_anyhow_conversion() {
        fn failing() -> StepResult<()> {
            Err(anyhow::anyhow!("user code blew up"))?;
            Ok(())
        }
        let err = failing().unwrap_err();
        assert!(matches!(err, StepError::Failed(_)));
    }

    #[test]
    fn test_extracted_error_display() {
        let err = ExtractedError {
            source: ErrorSource::Activity,
            message: "boom".into(),
            activity: Some("charge_card".into()),
            details: serde_json::json!({}),
        };
        assert_eq!(err.to_string(), "activity 'charge_card' failed: boom");
    }
}

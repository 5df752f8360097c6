//! Workflow rows and statuses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workflow lifecycle status
///
/// Created in `Running`; moves to exactly one terminal status, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// A workflow row from the store
#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub status: WorkflowStatus,
    pub module: String,
    /// Immutable input blob recorded at start
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Context attached to a `WORKFLOW_FAILED` transition
///
/// Records which task (if any) surfaced the failure and, when the cause
/// was an exhausted activity, the activity name so `result()` can surface
/// the failure with `source = ACTIVITY`.
#[derive(Debug, Clone, Default)]
pub struct FailureCause {
    pub task_id: Option<String>,
    pub task_kind: Option<crate::task::TaskKind>,
    pub activity: Option<String>,
}

impl FailureCause {
    pub fn for_task(task_id: &str, kind: crate::task::TaskKind) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            task_kind: Some(kind),
            activity: None,
        }
    }

    pub fn for_activity(name: &str) -> Self {
        Self {
            task_id: None,
            task_kind: None,
            activity: Some(name.to_string()),
        }
    }
}

/// Input for creating a workflow row
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Registry locator; combined with `name` to re-resolve the program
    /// across process restarts
    pub module: String,
}

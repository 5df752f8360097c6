//! Task queue rows and statuses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Target name used for timer tasks, which have no step or activity name.
pub const TIMER_TARGET: &str = "__timer__";

/// The kind of work a task represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Drives one replay tick of a workflow
    Step,
    /// Executes a scheduled activity
    Activity,
    /// Wakes a workflow when a timer's fire time is reached
    Timer,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "STEP",
            Self::Activity => "ACTIVITY",
            Self::Timer => "TIMER",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STEP" => Ok(Self::Step),
            "ACTIVITY" => Ok(Self::Activity),
            "TIMER" => Ok(Self::Timer),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A claimed or inspected task row
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    pub kind: TaskKind,
    /// Step or activity name; [`TIMER_TARGET`] for timers
    pub target: String,
    /// Earliest eligible execution time
    pub run_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the retry budget allows another attempt after a failure.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

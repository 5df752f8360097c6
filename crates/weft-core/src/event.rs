//! Workflow events for persistence
//!
//! Events form the append-only log for a workflow. They are used for:
//! - Persisting workflow progress
//! - Replaying workflows after recovery
//! - Auditing and debugging
//!
//! Events are immutable once written. Workflow state is reconstructed by
//! folding `STATE_SET`/`STATE_UPDATE` events in id order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata recorded when an activity is scheduled
///
/// The full metadata is persisted in the `ACTIVITY_SCHEDULED` payload so the
/// executor can re-resolve the handler and recover the arguments across
/// retries and process restarts. `(module, name)` is the registry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub retry_count: i64,
    pub timeout_seconds: i64,
    pub module: String,
    pub args: Vec<Value>,
}

/// Events stored in the `events` table
///
/// The wire form is internally tagged with `type`, matching the value in the
/// table's `type` column, so the payload blob is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEvent {
    /// Workflow was created with the given input
    WorkflowStarted { input: Value },

    /// Workflow ran all steps to completion
    WorkflowCompleted { completed_at: DateTime<Utc> },

    /// Workflow failed terminally
    WorkflowFailed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_kind: Option<String>,
        /// Set when the failure came from an exhausted activity
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<String>,
        failed_at: DateTime<Utc>,
    },

    /// Workflow was cancelled by an external request
    WorkflowCancelled {
        reason: String,
        cancelled_at: DateTime<Utc>,
    },

    /// A step began executing (structural marker, skipped by decision points)
    StepStart {
        step_name: String,
        started_at: DateTime<Utc>,
    },

    /// A step ran to completion
    StepEnd {
        step_name: String,
        completed_at: DateTime<Utc>,
    },

    /// An activity was scheduled for execution
    ActivityScheduled {
        #[serde(flatten)]
        metadata: ActivityMetadata,
    },

    /// An activity returned successfully
    ActivityCompleted { name: String, result: Value },

    /// An activity exhausted its retries
    ActivityFailed { name: String, error: String },

    /// A timer was scheduled
    TimerScheduled {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    /// A timer's fire time was reached
    TimerFired { timer_id: String },

    /// An external signal arrived
    SignalReceived {
        name: String,
        payload: Value,
        sent_at: DateTime<Utc>,
    },

    /// A single state key was written
    StateSet { key: String, value: Value },

    /// Several state keys were written in one event
    StateUpdate {
        values: serde_json::Map<String, Value>,
    },
}

impl WorkflowEvent {
    /// The discriminant stored in the `type` column.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Self::WorkflowCancelled { .. } => EventKind::WorkflowCancelled,
            Self::StepStart { .. } => EventKind::StepStart,
            Self::StepEnd { .. } => EventKind::StepEnd,
            Self::ActivityScheduled { .. } => EventKind::ActivityScheduled,
            Self::ActivityCompleted { .. } => EventKind::ActivityCompleted,
            Self::ActivityFailed { .. } => EventKind::ActivityFailed,
            Self::TimerScheduled { .. } => EventKind::TimerScheduled,
            Self::TimerFired { .. } => EventKind::TimerFired,
            Self::SignalReceived { .. } => EventKind::SignalReceived,
            Self::StateSet { .. } => EventKind::StateSet,
            Self::StateUpdate { .. } => EventKind::StateUpdate,
        }
    }

    /// Check if this event closes the workflow's log.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// The activity name if this is an activity-related event.
    pub fn activity_name(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { metadata } => Some(&metadata.name),
            Self::ActivityCompleted { name, .. } | Self::ActivityFailed { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Closed set of event type names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    StepStart,
    StepEnd,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    SignalReceived,
    StateSet,
    StateUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::WorkflowFailed => "WORKFLOW_FAILED",
            Self::WorkflowCancelled => "WORKFLOW_CANCELLED",
            Self::StepStart => "STEP_START",
            Self::StepEnd => "STEP_END",
            Self::ActivityScheduled => "ACTIVITY_SCHEDULED",
            Self::ActivityCompleted => "ACTIVITY_COMPLETED",
            Self::ActivityFailed => "ACTIVITY_FAILED",
            Self::TimerScheduled => "TIMER_SCHEDULED",
            Self::TimerFired => "TIMER_FIRED",
            Self::SignalReceived => "SIGNAL_RECEIVED",
            Self::StateSet => "STATE_SET",
            Self::StateUpdate => "STATE_UPDATE",
        }
    }

    /// Events that only bracket steps and never carry a decision.
    pub fn is_step_marker(&self) -> bool {
        matches!(self, Self::StepStart | Self::StepEnd)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted event row: the event plus its log position
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub workflow_id: String,
    pub event: WorkflowEvent,
    pub created_at: DateTime<Utc>,
}

/// Fold `STATE_SET`/`STATE_UPDATE` events over an empty map, in log order.
///
/// This is the single definition of state reconstruction, shared by the
/// replay engine (tick-initial state) and `Handle::result()`.
pub fn fold_state<'a, I>(events: I) -> serde_json::Map<String, Value>
where
    I: IntoIterator<Item = &'a WorkflowEvent>,
{
    let mut state = serde_json::Map::new();
    for event in events {
        match event {
            WorkflowEvent::StateSet { key, value } => {
                state.insert(key.clone(), value.clone());
            }
            WorkflowEvent::StateUpdate { values } => {
                for (key, value) in values {
                    state.insert(key.clone(), value.clone());
                }
            }
            _ => {}
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_includes_type_tag() {
        let event = WorkflowEvent::WorkflowStarted {
            input: json!({"name": "World"}),
        };

        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"type\":\"WORKFLOW_STARTED\""));

        let parsed: WorkflowEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_scheduled_flattens_metadata() {
        let event = WorkflowEvent::ActivityScheduled {
            metadata: ActivityMetadata {
                name: "format_greeting".into(),
                description: String::new(),
                retry_count: 3,
                timeout_seconds: 10,
                module: "demo::greetings".into(),
                args: vec![json!("World")],
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        // The executor queries payload->>'$.name', so the name must be
        // at the top level of the payload.
        assert_eq!(value["name"], json!("format_greeting"));
        assert_eq!(value["type"], json!("ACTIVITY_SCHEDULED"));

        let parsed: WorkflowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted {
            completed_at: Utc::now()
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowFailed {
            error: "boom".into(),
            task_id: None,
            task_kind: None,
            activity: None,
            failed_at: Utc::now(),
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "operator".into(),
            cancelled_at: Utc::now(),
        }
        .is_terminal());

        assert!(!WorkflowEvent::WorkflowStarted { input: json!({}) }.is_terminal());
        assert!(!WorkflowEvent::TimerFired {
            timer_id: "t".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_fold_state_set_then_update() {
        let events = vec![
            WorkflowEvent::StateSet {
                key: "count".into(),
                value: json!(1),
            },
            WorkflowEvent::StateUpdate {
                values: serde_json::from_value(json!({"count": 2, "done": true})).unwrap(),
            },
            WorkflowEvent::StateSet {
                key: "name".into(),
                value: json!("weft"),
            },
        ];

        let state = fold_state(&events);
        assert_eq!(state["count"], json!(2));
        assert_eq!(state["done"], json!(true));
        assert_eq!(state["name"], json!("weft"));
    }

    #[test]
    fn test_fold_state_ignores_non_state_events() {
        let events = vec![
            WorkflowEvent::WorkflowStarted { input: json!({}) },
            WorkflowEvent::TimerFired {
                timer_id: "t".into(),
            },
        ];
        assert!(fold_state(&events).is_empty());
    }

    #[test]
    fn test_kind_round_trip() {
        let event = WorkflowEvent::SignalReceived {
            name: "go".into(),
            payload: json!({"n": 7}),
            sent_at: Utc::now(),
        };
        assert_eq!(event.kind().as_str(), "SIGNAL_RECEIVED");

        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains(event.kind().as_str()));
    }
}

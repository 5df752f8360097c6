//! Integration tests for the SQLite store
//!
//! Each test runs against a private in-memory database and exercises the
//! invariants the engine relies on: append-only ordering, terminal
//! finality, driver uniqueness, atomic claiming and retry scheduling.

use chrono::{Duration, Utc};
use serde_json::json;

use weft_core::{
    retry_delay, ActivityMetadata, FailureCause, NewWorkflow, TaskKind, TaskStatus, WorkflowEvent,
    WorkflowStatus,
};
use weft_store::{EventStore, SqliteStore, StoreError};

async fn fresh_store() -> SqliteStore {
    let store = SqliteStore::in_memory().await.expect("in-memory store");
    store.init().await.expect("migrations");
    store
}

fn sample_workflow() -> NewWorkflow {
    NewWorkflow {
        name: "OrderWorkflow".into(),
        description: "test workflow".into(),
        version: "1.0.0".into(),
        module: "tests::orders".into(),
    }
}

fn sample_activity(name: &str, retry_count: i64) -> ActivityMetadata {
    ActivityMetadata {
        name: name.into(),
        description: String::new(),
        retry_count,
        timeout_seconds: 30,
        module: "tests::orders".into(),
        args: vec![json!("a"), json!(2)],
    }
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let store = fresh_store().await;
    store.init().await.expect("second init");
}

#[tokio::test]
async fn test_create_workflow_seeds_row_event_and_driver() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({"order": 7}))
        .await
        .unwrap();

    let row = store.get_workflow(&id).await.unwrap();
    assert_eq!(row.status, WorkflowStatus::Running);
    assert_eq!(row.name, "OrderWorkflow");
    assert_eq!(row.input, json!({"order": 7}));

    let events = store.list_events(&id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].event,
        WorkflowEvent::WorkflowStarted { .. }
    ));

    let task = store.claim_task().await.unwrap().expect("driver task");
    assert_eq!(task.kind, TaskKind::Step);
    assert_eq!(task.workflow_id, id);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_event_ids_strictly_increase() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    for i in 0..5 {
        store
            .append_event(
                &id,
                &WorkflowEvent::StateSet {
                    key: format!("k{i}"),
                    value: json!(i),
                },
            )
            .await
            .unwrap();
    }

    let events = store.list_events(&id).await.unwrap();
    for pair in events.windows(2) {
        assert!(pair[0].id < pair[1].id, "event ids must strictly increase");
    }
}

#[tokio::test]
async fn test_append_refused_after_terminal() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    store.mark_completed(&id).await.unwrap();

    let err = store
        .append_event(
            &id,
            &WorkflowEvent::StateSet {
                key: "late".into(),
                value: json!(true),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WorkflowTerminal(..)));

    // Terminal transitions are idempotent and do not double-append.
    store.mark_completed(&id).await.unwrap();
    store
        .mark_failed(&id, "too late", FailureCause::default())
        .await
        .unwrap();
    let events = store.list_events(&id).await.unwrap();
    let terminal_count = events.iter().filter(|e| e.event.is_terminal()).count();
    assert_eq!(terminal_count, 1);
}

#[tokio::test]
async fn test_claim_skips_future_run_at() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    // Consume the driver so only the timer task remains.
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    store
        .create_timer(&id, Utc::now() + Duration::seconds(60))
        .await
        .unwrap();

    assert!(store.claim_task().await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_orders_by_run_at_then_created_at() {
    let store = fresh_store().await;
    let first = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    let claimed = store.claim_task().await.unwrap().unwrap();
    assert_eq!(claimed.workflow_id, first);
    let claimed = store.claim_task().await.unwrap().unwrap();
    assert_eq!(claimed.workflow_id, second);
}

#[tokio::test]
async fn test_concurrent_claims_never_hand_out_a_task_twice() {
    let store = fresh_store().await;
    for _ in 0..10 {
        store
            .create_workflow(&sample_workflow(), &json!({}))
            .await
            .unwrap();
    }

    let mut claimed = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = store.claim_task().await.unwrap() {
                mine.push(task.id);
            }
            mine
        }));
    }
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }

    assert_eq!(claimed.len(), 10);
    let unique: std::collections::HashSet<_> = claimed.iter().collect();
    assert_eq!(unique.len(), 10, "a task was claimed twice");
}

#[tokio::test]
async fn test_driver_uniqueness_under_repeated_rotation() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    // Racing rotations and a signal must never yield two live drivers.
    store.rotate_driver(&id).await.unwrap();
    store.rotate_driver(&id).await.unwrap();
    store.create_signal(&id, "poke", &json!({})).await.unwrap();

    let live = count_live_step_tasks(&store, &id).await;
    assert_eq!(live, 1, "exactly one PENDING/RUNNING STEP task expected");

    // Rotating while one driver is RUNNING completes it and enqueues one.
    let task = store.claim_task().await.unwrap().unwrap();
    assert_eq!(task.kind, TaskKind::Step);
    store.rotate_driver(&id).await.unwrap();
    let live = count_live_step_tasks(&store, &id).await;
    assert_eq!(live, 1);
}

async fn count_live_step_tasks(store: &SqliteStore, workflow_id: &str) -> i64 {
    use sqlx::Row;
    sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM tasks
        WHERE workflow_id = ?1 AND kind = 'STEP' AND status IN ('PENDING', 'RUNNING')
        "#,
    )
    .bind(workflow_id)
    .fetch_one(store.pool())
    .await
    .unwrap()
    .get("n")
}

#[tokio::test]
async fn test_schedule_retry_honours_backoff_bound() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    let task = store.claim_task().await.unwrap().unwrap();
    let before = Utc::now();
    let delay = retry_delay(task.attempts);
    store
        .schedule_retry(&task.id, before + Duration::from_std(delay).unwrap(), "boom")
        .await
        .unwrap();

    // Not claimable until the new run_at.
    assert!(store.claim_task().await.unwrap().is_none());

    use sqlx::Row;
    let row = sqlx::query("SELECT run_at, status, last_error FROM tasks WHERE id = ?1")
        .bind(&task.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    let run_at: chrono::DateTime<Utc> = row.get("run_at");
    let status: String = row.get("status");
    assert_eq!(status, "PENDING");
    assert!(run_at - before >= Duration::from_std(delay).unwrap());
    assert_eq!(row.get::<Option<String>, _>("last_error").as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_release_task_keeps_run_at() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    let fire_at = Utc::now() - Duration::seconds(1);
    let timer_id = store.create_timer(&id, fire_at).await.unwrap();

    let task = store.claim_task().await.unwrap().unwrap();
    assert_eq!(task.id, timer_id);
    store.release_task(&task.id).await.unwrap();

    let again = store.claim_task().await.unwrap().unwrap();
    assert_eq!(again.id, timer_id);
    assert_eq!(again.attempts, 2);
    assert_eq!(again.run_at.timestamp_millis(), task.run_at.timestamp_millis());
}

#[tokio::test]
async fn test_create_activity_writes_event_and_task_atomically() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    store
        .create_activity(&id, &sample_activity("charge_card", 3))
        .await
        .unwrap();

    let events = store.list_events(&id).await.unwrap();
    let scheduled = events
        .iter()
        .find(|e| matches!(&e.event, WorkflowEvent::ActivityScheduled { .. }))
        .expect("scheduled event");
    if let WorkflowEvent::ActivityScheduled { metadata } = &scheduled.event {
        assert_eq!(metadata.name, "charge_card");
        assert_eq!(metadata.args, vec![json!("a"), json!(2)]);
    }

    let task = store.claim_task().await.unwrap().unwrap();
    assert_eq!(task.kind, TaskKind::Activity);
    assert_eq!(task.target, "charge_card");
    assert_eq!(task.max_attempts, 3);
}

#[tokio::test]
async fn test_get_activity_event_offsets_by_call() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    let mut first = sample_activity("fetch", 0);
    first.args = vec![json!(1)];
    let mut second = sample_activity("fetch", 0);
    second.args = vec![json!(2)];
    store.create_activity(&id, &first).await.unwrap();
    store.create_activity(&id, &second).await.unwrap();

    let event = store.get_activity_event(&id, "fetch", 1).await.unwrap();
    assert!(
        matches!(event, Some(WorkflowEvent::ActivityScheduled { metadata }) if metadata.args == vec![json!(1)])
    );
    let event = store.get_activity_event(&id, "fetch", 2).await.unwrap();
    assert!(
        matches!(event, Some(WorkflowEvent::ActivityScheduled { metadata }) if metadata.args == vec![json!(2)])
    );
    assert!(store
        .get_activity_event(&id, "fetch", 3)
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_activity_event(&id, "missing", 1)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_complete_activity_rotates_driver() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    store
        .create_activity(&id, &sample_activity("charge_card", 0))
        .await
        .unwrap();
    let task = store.claim_task().await.unwrap().unwrap();

    store
        .complete_activity(&id, &task.id, "charge_card", &json!({"ok": true}))
        .await
        .unwrap();

    let events = store.list_events(&id).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ActivityCompleted { name, result }
            if name == "charge_card" && *result == json!({"ok": true})
    )));

    // A fresh driver was enqueued in the same transaction.
    let next = store.claim_task().await.unwrap().unwrap();
    assert_eq!(next.kind, TaskKind::Step);
    assert_eq!(next.workflow_id, id);
}

#[tokio::test]
async fn test_fail_activity_records_fails_and_rotates_atomically() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    store
        .create_activity(&id, &sample_activity("charge_card", 0))
        .await
        .unwrap();
    let task = store.claim_task().await.unwrap().unwrap();

    store
        .fail_activity(&id, &task.id, "charge_card", "card declined")
        .await
        .unwrap();

    let events = store.list_events(&id).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ActivityFailed { name, error }
            if name == "charge_card" && error == "card declined"
    )));

    use sqlx::Row;
    let row = sqlx::query("SELECT status, last_error FROM tasks WHERE id = ?1")
        .bind(&task.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "FAILED");
    assert_eq!(
        row.get::<Option<String>, _>("last_error").as_deref(),
        Some("card declined")
    );

    // A fresh driver was enqueued in the same transaction, so the next
    // tick surfaces the permanent failure.
    let next = store.claim_task().await.unwrap().unwrap();
    assert_eq!(next.kind, TaskKind::Step);
    assert_eq!(next.workflow_id, id);
}

#[tokio::test]
async fn test_fail_activity_after_terminal_only_fails_the_task() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    store
        .create_activity(&id, &sample_activity("charge_card", 0))
        .await
        .unwrap();
    let task = store.claim_task().await.unwrap().unwrap();

    // The workflow finishes while the activity is still running.
    store.mark_cancelled(&id, "operator request").await.unwrap();
    store
        .fail_activity(&id, &task.id, "charge_card", "boom")
        .await
        .unwrap();

    // No event follows the terminal one; the task is just failed.
    let events = store.list_events(&id).await.unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(&e.event, WorkflowEvent::ActivityFailed { .. })));
    let terminal_pos = events
        .iter()
        .position(|e| e.event.is_terminal())
        .expect("terminal event");
    assert_eq!(terminal_pos, events.len() - 1);

    assert!(store.claim_task().await.unwrap().is_none());
}

#[tokio::test]
async fn test_fire_timer_appends_and_rotates() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let driver = store.claim_task().await.unwrap().unwrap();
    store.complete_task(&driver.id).await.unwrap();

    let timer_id = store
        .create_timer(&id, Utc::now() - Duration::seconds(1))
        .await
        .unwrap();
    let task = store.claim_task().await.unwrap().unwrap();
    assert_eq!(task.id, timer_id);

    store.fire_timer(&id, &task.id).await.unwrap();

    let events = store.list_events(&id).await.unwrap();
    let scheduled_pos = events
        .iter()
        .position(|e| matches!(&e.event, WorkflowEvent::TimerScheduled { .. }))
        .unwrap();
    let fired_pos = events
        .iter()
        .position(
            |e| matches!(&e.event, WorkflowEvent::TimerFired { timer_id: t } if *t == timer_id),
        )
        .unwrap();
    assert!(scheduled_pos < fired_pos);

    let next = store.claim_task().await.unwrap().unwrap();
    assert_eq!(next.kind, TaskKind::Step);
}

#[tokio::test]
async fn test_signal_requires_running_workflow() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    store.create_signal(&id, "go", &json!({"n": 7})).await.unwrap();

    store.mark_completed(&id).await.unwrap();
    let err = store
        .create_signal(&id, "go", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WorkflowNotRunning(..)));

    let err = store
        .create_signal("no-such-workflow", "go", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WorkflowNotFound(_)));
}

#[tokio::test]
async fn test_terminal_finality_leaves_nothing_claimable() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    store
        .mark_failed(&id, "boom", FailureCause::for_task("t1", TaskKind::Step))
        .await
        .unwrap();

    assert_eq!(
        store.get_workflow_status(&id).await.unwrap(),
        WorkflowStatus::Failed
    );
    assert!(store.claim_task().await.unwrap().is_none());

    let events = store.list_events(&id).await.unwrap();
    let failed = events
        .iter()
        .find_map(|e| match &e.event {
            WorkflowEvent::WorkflowFailed {
                error, task_kind, ..
            } => Some((error.clone(), task_kind.clone())),
            _ => None,
        })
        .expect("failure event");
    assert_eq!(failed.0, "boom");
    assert_eq!(failed.1.as_deref(), Some("STEP"));
}

#[tokio::test]
async fn test_mark_cancelled_fails_pending_tasks() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    store.mark_cancelled(&id, "operator request").await.unwrap();

    assert_eq!(
        store.get_workflow_status(&id).await.unwrap(),
        WorkflowStatus::Canceled
    );
    assert!(store.claim_task().await.unwrap().is_none());

    let events = store.list_events(&id).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::WorkflowCancelled { reason, .. } if reason == "operator request"
    )));
}

#[tokio::test]
async fn test_list_workflows_filters_by_status() {
    let store = fresh_store().await;
    let a = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    let _b = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();
    store.mark_completed(&a).await.unwrap();

    let running = store
        .list_workflows(Some(WorkflowStatus::Running), 10)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);

    let all = store.list_workflows(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);

    let limited = store.list_workflows(None, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_logs_and_stats() {
    let store = fresh_store().await;
    let id = store
        .create_workflow(&sample_workflow(), &json!({}))
        .await
        .unwrap();

    store
        .append_log(&id, weft_core::LogLevel::Info, "starting up")
        .await
        .unwrap();
    let logs = store.list_logs(&id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, "INFO");
    assert_eq!(logs[0].message, "starting up");

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.logs, 1);
    assert_eq!(stats.events, 1);
    assert!(stats
        .workflows
        .iter()
        .any(|(status, count)| status == "RUNNING" && *count == 1));
}

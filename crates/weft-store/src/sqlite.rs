//! SQLite implementation of EventStore
//!
//! Production persistence using sqlx with:
//! - Single-statement atomic task claiming via `UPDATE ... RETURNING`
//! - Transactional event + task writes for every scheduling operation
//! - Embedded, reversible migrations

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, error, instrument};

use weft_core::{
    ActivityMetadata, EventRecord, FailureCause, LogEntry, LogLevel, NewWorkflow, Task, TaskKind,
    TaskStatus, WorkflowEvent, WorkflowRow, WorkflowStatus,
};

use crate::store::{new_row_id, EventStore, StoreError, StoreStats};

/// Embedded schema migrations (idempotent, reversible).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Default retry budget for STEP and TIMER tasks. Activity tasks carry
/// their own budget from the activity's `retry_count`.
const DEFAULT_TASK_ATTEMPTS: i64 = 3;

/// SQLite-backed store
///
/// Wraps a connection pool; cheap to clone. SQLite serializes writers, so
/// the single-statement claim is race-free under N workers.
///
/// # Example
///
/// ```ignore
/// let store = SqliteStore::connect("sqlite:.weft/weft.db?mode=rwc").await?;
/// store.init().await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL, creating the file if missing
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Connect to a private in-memory database (tests)
    ///
    /// A single connection is required: each SQLite `:memory:` connection
    /// is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Run migrations; safe to call repeatedly
    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn workflow_status_conn(
        conn: &mut SqliteConnection,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        parse_workflow_status(row.get("status"))
    }

    async fn insert_event_conn(
        conn: &mut SqliteConnection,
        workflow_id: &str,
        event: &WorkflowEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)?;

        sqlx::query(
            r#"
            INSERT INTO events (workflow_id, type, payload, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(workflow_id)
        .bind(event.kind().as_str())
        .bind(payload)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Complete the RUNNING STEP driver and insert a fresh PENDING one,
    /// unless a PENDING driver already exists (keeps the driver unique).
    async fn rotate_driver_conn(
        conn: &mut SqliteConnection,
        workflow_id: &str,
        workflow_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'COMPLETED', updated_at = ?2
            WHERE workflow_id = ?1 AND kind = 'STEP' AND status = 'RUNNING'
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let pending: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT id FROM tasks
            WHERE workflow_id = ?1 AND kind = 'STEP' AND status = 'PENDING'
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *conn)
        .await?;

        if pending.is_none() {
            sqlx::query(
                r#"
                INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                                   attempts, max_attempts, created_at, updated_at)
                VALUES (?1, ?2, 'STEP', ?3, ?4, 'PENDING', 0, ?5, ?4, ?4)
                "#,
            )
            .bind(new_row_id())
            .bind(workflow_id)
            .bind(workflow_name)
            .bind(now)
            .bind(DEFAULT_TASK_ATTEMPTS)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    async fn complete_task_conn(
        conn: &mut SqliteConnection,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'COMPLETED', updated_at = ?2
            WHERE id = ?1 AND status = 'RUNNING'
            "#,
        )
        .bind(task_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn fail_task_conn(
        conn: &mut SqliteConnection,
        task_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED', last_error = ?2, updated_at = ?3
            WHERE id = ?1 AND status = 'RUNNING'
            "#,
        )
        .bind(task_id)
        .bind(error)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    #[instrument(skip(self, workflow, input))]
    async fn create_workflow(
        &self,
        workflow: &NewWorkflow,
        input: &Value,
    ) -> Result<String, StoreError> {
        let workflow_id = new_row_id();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, description, version, status, module,
                                   input, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(&workflow_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.version)
        .bind(&workflow.module)
        .bind(serde_json::to_string(input)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let started = WorkflowEvent::WorkflowStarted {
            input: input.clone(),
        };
        Self::insert_event_conn(&mut tx, &workflow_id, &started, now).await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                               attempts, max_attempts, created_at, updated_at)
            VALUES (?1, ?2, 'STEP', ?3, ?4, 'PENDING', 0, ?5, ?4, ?4)
            "#,
        )
        .bind(new_row_id())
        .bind(&workflow_id)
        .bind(&workflow.name)
        .bind(now)
        .bind(DEFAULT_TASK_ATTEMPTS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(%workflow_id, name = %workflow.name, "created workflow");
        Ok(workflow_id)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, version, status, module, input,
                   created_at, updated_at
            FROM workflows
            WHERE id = ?1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        workflow_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        parse_workflow_status(row.get("status"))
    }

    #[instrument(skip(self))]
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: i64,
    ) -> Result<Vec<WorkflowRow>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT id, name, description, version, status, module, input,
                           created_at, updated_at
                    FROM workflows
                    WHERE status = ?1
                    ORDER BY created_at DESC
                    LIMIT ?2
                    "#,
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, name, description, version, status, module, input,
                           created_at, updated_at
                    FROM workflows
                    ORDER BY created_at DESC
                    LIMIT ?1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self, event), fields(event_type = %event.kind()))]
    async fn append_event(
        &self,
        workflow_id: &str,
        event: &WorkflowEvent,
    ) -> Result<(), StoreError> {
        self.append_events(workflow_id, std::slice::from_ref(event))
            .await
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        workflow_id: &str,
        events: &[WorkflowEvent],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = Self::workflow_status_conn(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(
                workflow_id.to_string(),
                status,
            ));
        }

        for event in events {
            Self::insert_event_conn(&mut tx, workflow_id, event, now).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, payload, created_at
            FROM events
            WHERE workflow_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            events.push(EventRecord {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                event: serde_json::from_str(&payload)?,
                created_at: row.get("created_at"),
            });
        }
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn get_activity_event(
        &self,
        workflow_id: &str,
        activity_name: &str,
        attempt: i64,
    ) -> Result<Option<WorkflowEvent>, StoreError> {
        let offset = (attempt - 1).max(0);

        let row = sqlx::query(
            r#"
            SELECT payload
            FROM events
            WHERE workflow_id = ?1
              AND type = 'ACTIVITY_SCHEDULED'
              AND json_extract(payload, '$.name') = ?2
            ORDER BY id ASC
            LIMIT 1 OFFSET ?3
            "#,
        )
        .bind(workflow_id)
        .bind(activity_name)
        .bind(offset)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn claim_task(&self) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();

        // Single-statement claim: the correlated subquery selects exactly
        // one eligible row and the UPDATE flips it atomically, so no two
        // workers can claim the same task.
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING',
                attempts = attempts + 1,
                updated_at = ?1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'PENDING' AND run_at <= ?1
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING id, workflow_id, kind, target, run_at, status,
                      attempts, max_attempts, last_error, created_at, updated_at
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let task = task_from_row(&row)?;
                debug!(task_id = %task.id, kind = %task.kind, "claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::complete_task_conn(&mut conn, task_id, Utc::now()).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_task(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::fail_task_conn(&mut conn, task_id, error, Utc::now()).await?;

        debug!(%task_id, "failed task");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_task(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PENDING', updated_at = ?2
            WHERE id = ?1 AND status = 'RUNNING'
            "#,
        )
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn schedule_retry(
        &self,
        task_id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PENDING', run_at = ?2, last_error = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(task_id)
        .bind(run_at)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(%task_id, %run_at, "scheduled retry");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rotate_driver(&self, workflow_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT name FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let name: String = row.get("name");

        Self::rotate_driver_conn(&mut tx, workflow_id, &name, now).await?;
        tx.commit().await?;

        debug!(%workflow_id, "rotated driver");
        Ok(())
    }

    #[instrument(skip(self, metadata), fields(activity = %metadata.name))]
    async fn create_activity(
        &self,
        workflow_id: &str,
        metadata: &ActivityMetadata,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = Self::workflow_status_conn(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(
                workflow_id.to_string(),
                status,
            ));
        }

        let event = WorkflowEvent::ActivityScheduled {
            metadata: metadata.clone(),
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                               attempts, max_attempts, created_at, updated_at)
            VALUES (?1, ?2, 'ACTIVITY', ?3, ?4, 'PENDING', 0, ?5, ?4, ?4)
            "#,
        )
        .bind(new_row_id())
        .bind(workflow_id)
        .bind(&metadata.name)
        .bind(now)
        .bind(metadata.retry_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(%workflow_id, activity = %metadata.name, "scheduled activity");
        Ok(())
    }

    #[instrument(skip(self, result))]
    async fn complete_activity(
        &self,
        workflow_id: &str,
        task_id: &str,
        activity_name: &str,
        result: &Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT name, status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let name: String = row.get("name");
        let status = parse_workflow_status(row.get("status"))?;

        if status.is_terminal() {
            // Benign race: the workflow finished while the activity ran.
            Self::complete_task_conn(&mut tx, task_id, now).await?;
            tx.commit().await?;
            return Ok(());
        }

        let event = WorkflowEvent::ActivityCompleted {
            name: activity_name.to_string(),
            result: result.clone(),
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;
        Self::complete_task_conn(&mut tx, task_id, now).await?;
        Self::rotate_driver_conn(&mut tx, workflow_id, &name, now).await?;

        tx.commit().await?;

        debug!(%workflow_id, activity = %activity_name, "completed activity");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_activity(
        &self,
        workflow_id: &str,
        task_id: &str,
        activity_name: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT name, status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let name: String = row.get("name");
        let status = parse_workflow_status(row.get("status"))?;

        if status.is_terminal() {
            // Benign race: the workflow finished while the activity ran.
            Self::fail_task_conn(&mut tx, task_id, error, now).await?;
            tx.commit().await?;
            return Ok(());
        }

        let event = WorkflowEvent::ActivityFailed {
            name: activity_name.to_string(),
            error: error.to_string(),
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;
        Self::fail_task_conn(&mut tx, task_id, error, now).await?;
        Self::rotate_driver_conn(&mut tx, workflow_id, &name, now).await?;

        tx.commit().await?;

        debug!(%workflow_id, activity = %activity_name, "activity permanently failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_timer(
        &self,
        workflow_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let timer_id = new_row_id();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = Self::workflow_status_conn(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(
                workflow_id.to_string(),
                status,
            ));
        }

        let event = WorkflowEvent::TimerScheduled {
            timer_id: timer_id.clone(),
            fire_at,
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                               attempts, max_attempts, created_at, updated_at)
            VALUES (?1, ?2, 'TIMER', ?3, ?4, 'PENDING', 0, ?5, ?6, ?6)
            "#,
        )
        .bind(&timer_id)
        .bind(workflow_id)
        .bind(weft_core::task::TIMER_TARGET)
        .bind(fire_at)
        .bind(DEFAULT_TASK_ATTEMPTS)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(%workflow_id, %timer_id, %fire_at, "scheduled timer");
        Ok(timer_id)
    }

    #[instrument(skip(self))]
    async fn fire_timer(&self, workflow_id: &str, task_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT name, status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let name: String = row.get("name");
        let status = parse_workflow_status(row.get("status"))?;

        if status.is_terminal() {
            Self::complete_task_conn(&mut tx, task_id, now).await?;
            tx.commit().await?;
            return Ok(());
        }

        let event = WorkflowEvent::TimerFired {
            timer_id: task_id.to_string(),
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;
        Self::complete_task_conn(&mut tx, task_id, now).await?;
        Self::rotate_driver_conn(&mut tx, workflow_id, &name, now).await?;

        tx.commit().await?;

        debug!(%workflow_id, timer_id = %task_id, "timer fired");
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn create_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT name, status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let workflow_name: String = row.get("name");
        let status = parse_workflow_status(row.get("status"))?;

        if status != WorkflowStatus::Running {
            return Err(StoreError::WorkflowNotRunning(
                workflow_id.to_string(),
                status,
            ));
        }

        let event = WorkflowEvent::SignalReceived {
            name: name.to_string(),
            payload: payload.clone(),
            sent_at: now,
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;

        // Wake the workflow so the next tick observes the signal.
        Self::rotate_driver_conn(&mut tx, workflow_id, &workflow_name, now).await?;

        tx.commit().await?;

        debug!(%workflow_id, signal = %name, "signal received");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_completed(&self, workflow_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = Self::workflow_status_conn(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Ok(());
        }

        let event = WorkflowEvent::WorkflowCompleted { completed_at: now };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;

        sqlx::query("UPDATE workflows SET status = 'COMPLETED', updated_at = ?2 WHERE id = ?1")
            .bind(workflow_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'COMPLETED', updated_at = ?2
            WHERE workflow_id = ?1 AND kind = 'STEP' AND status = 'RUNNING'
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(%workflow_id, "workflow completed");
        Ok(())
    }

    #[instrument(skip(self, cause))]
    async fn mark_failed(
        &self,
        workflow_id: &str,
        error: &str,
        cause: FailureCause,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = Self::workflow_status_conn(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Ok(());
        }

        let event = WorkflowEvent::WorkflowFailed {
            error: error.to_string(),
            task_id: cause.task_id,
            task_kind: cause.task_kind.map(|kind| kind.as_str().to_string()),
            activity: cause.activity,
            failed_at: now,
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;

        sqlx::query("UPDATE workflows SET status = 'FAILED', updated_at = ?2 WHERE id = ?1")
            .bind(workflow_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED', last_error = 'workflow failed', updated_at = ?2
            WHERE workflow_id = ?1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        error!(%workflow_id, %error, "workflow failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_cancelled(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = Self::workflow_status_conn(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Ok(());
        }

        let event = WorkflowEvent::WorkflowCancelled {
            reason: reason.to_string(),
            cancelled_at: now,
        };
        Self::insert_event_conn(&mut tx, workflow_id, &event, now).await?;

        sqlx::query("UPDATE workflows SET status = 'CANCELED', updated_at = ?2 WHERE id = ?1")
            .bind(workflow_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED', last_error = 'workflow cancelled', updated_at = ?2
            WHERE workflow_id = ?1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(%workflow_id, %reason, "workflow cancelled");
        Ok(())
    }

    async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO logs (workflow_id, level, message, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(workflow_id)
        .bind(level.as_str())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_logs(&self, workflow_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, level, message, created_at
            FROM logs
            WHERE workflow_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LogEntry {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                level: row.get("level"),
                message: row.get("message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let workflow_rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM workflows GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let task_rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let events: i64 = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let logs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM logs")
            .fetch_one(&self.pool)
            .await?
            .get("n");

        Ok(StoreStats {
            workflows: workflow_rows
                .into_iter()
                .map(|r| (r.get("status"), r.get("n")))
                .collect(),
            tasks: task_rows
                .into_iter()
                .map(|r| (r.get("status"), r.get("n")))
                .collect(),
            events,
            logs,
        })
    }
}

// Helper functions

fn parse_workflow_status(status: &str) -> Result<WorkflowStatus, StoreError> {
    status.parse().map_err(StoreError::Database)
}

fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowRow, StoreError> {
    let status: String = row.get("status");
    let input: String = row.get("input");

    Ok(WorkflowRow {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        version: row.get("version"),
        status: parse_workflow_status(&status)?,
        module: row.get("module"),
        input: serde_json::from_str(&input)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    Ok(Task {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        kind: kind.parse::<TaskKind>().map_err(StoreError::Database)?,
        target: row.get("target"),
        run_at: row.get("run_at"),
        status: status.parse::<TaskStatus>().map_err(StoreError::Database)?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

//! Concrete Postgres [`TaskStorage`] backend (feature `postgres`).
//!
//! Grounded on the teacher's `Job` (`kernel/jobs/job.rs`) and its
//! `upsert`/`claim_jobs` raw-SQL style: plain `sqlx::query!`-free string
//! queries against a `tasks` table, `FOR UPDATE SKIP LOCKED` is left to
//! the worker-queue enqueue path rather than used here since spec.md's
//! contract has no polling-claim operation — the engine's own scheduler
//! and bounded queues already serialize access to a handle in memory.
//!
//! Concrete storage backends are explicitly out of spec.md's scope
//! (§1): this module exists to demonstrate the abstract contract is
//! actually implementable against a real driver, matching the stack the
//! teacher ships with (`sqlx`, `chrono`, `uuid`, `json` features).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::{StorageResult, TaskStorage};
use crate::model::{
    AuditLevel, ExecutionLogEntry, LogLevel, PersistedTask, TaskId, TaskStatus,
};

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        PostgresStorage { pool }
    }

    /// Creates the `tasks`, `status_audit`, `run_audit`, and
    /// `execution_logs` tables if absent (spec §6.4). Migration
    /// management beyond this is out of scope.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id UUID PRIMARY KEY,
                task_type TEXT NOT NULL,
                handler_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                scheduled_execution_utc TIMESTAMPTZ,
                last_execution_utc TIMESTAMPTZ,
                current_run_count INTEGER NOT NULL DEFAULT 0,
                recurring_info JSONB,
                max_runs INTEGER,
                run_until_utc TIMESTAMPTZ,
                task_key TEXT,
                audit_level TEXT NOT NULL,
                created_at_utc TIMESTAMPTZ NOT NULL,
                exception TEXT
            );
            CREATE INDEX IF NOT EXISTS tasks_status_idx ON tasks (status);
            CREATE INDEX IF NOT EXISTS tasks_scheduled_idx ON tasks (scheduled_execution_utc);
            CREATE UNIQUE INDEX IF NOT EXISTS tasks_task_key_idx ON tasks (task_key)
                WHERE status NOT IN ('completed', 'failed', 'cancelled', 'service_stopped');

            CREATE TABLE IF NOT EXISTS status_audit (
                task_id UUID NOT NULL,
                new_status TEXT NOT NULL,
                changed_at_utc TIMESTAMPTZ NOT NULL,
                exception TEXT
            );
            CREATE TABLE IF NOT EXISTS run_audit (
                task_id UUID NOT NULL,
                execution_started_utc TIMESTAMPTZ NOT NULL,
                execution_completed_utc TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                exception TEXT
            );
            CREATE TABLE IF NOT EXISTS execution_logs (
                task_id UUID NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp_utc TIMESTAMPTZ NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                exception TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<PersistedTask, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let audit_str: String = row.try_get("audit_level")?;
        let recurring_json: Option<serde_json::Value> = row.try_get("recurring_info")?;

        Ok(PersistedTask::builder()
            .id(row.try_get::<TaskId, _>("id")?)
            .task_type(row.try_get::<String, _>("task_type")?)
            .handler_type(row.try_get::<String, _>("handler_type")?)
            .payload(row.try_get::<String, _>("payload")?)
            .status(parse_status(&status_str))
            .queue_name(row.try_get::<String, _>("queue_name")?)
            .scheduled_execution_utc(row.try_get::<Option<DateTime<Utc>>, _>("scheduled_execution_utc")?)
            .last_execution_utc(row.try_get::<Option<DateTime<Utc>>, _>("last_execution_utc")?)
            .current_run_count(row.try_get::<i32, _>("current_run_count")? as u32)
            .recurring_info(recurring_json.and_then(|v| serde_json::from_value(v).ok()))
            .max_runs(row.try_get::<Option<i32>, _>("max_runs")?.map(|v| v as u32))
            .run_until_utc(row.try_get::<Option<DateTime<Utc>>, _>("run_until_utc")?)
            .task_key(row.try_get::<Option<String>, _>("task_key")?)
            .audit_level(parse_audit_level(&audit_str))
            .created_at_utc(row.try_get::<DateTime<Utc>, _>("created_at_utc")?)
            .exception(row.try_get::<Option<String>, _>("exception")?)
            .build())
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::WaitingQueue => "waiting_queue",
        TaskStatus::Queued => "queued",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::ServiceStopped => "service_stopped",
    }
}

fn parse_status(s: &str) -> TaskStatus {
    match s {
        "queued" => TaskStatus::Queued,
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        "service_stopped" => TaskStatus::ServiceStopped,
        _ => TaskStatus::WaitingQueue,
    }
}

fn audit_level_str(level: AuditLevel) -> &'static str {
    match level {
        AuditLevel::Full => "full",
        AuditLevel::Minimal => "minimal",
        AuditLevel::ErrorsOnly => "errors_only",
        AuditLevel::None => "none",
    }
}

fn parse_audit_level(s: &str) -> AuditLevel {
    match s {
        "minimal" => AuditLevel::Minimal,
        "errors_only" => AuditLevel::ErrorsOnly,
        "none" => AuditLevel::None,
        _ => AuditLevel::Full,
    }
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

#[async_trait]
impl TaskStorage for PostgresStorage {
    async fn persist(&self, task: PersistedTask) -> StorageResult<TaskId> {
        let recurring_json = task
            .recurring_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, handler_type, payload, status, queue_name,
                scheduled_execution_utc, last_execution_utc, current_run_count,
                recurring_info, max_runs, run_until_utc, task_key, audit_level,
                created_at_utc, exception
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            "#,
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(&task.handler_type)
        .bind(&task.payload)
        .bind(status_str(task.status))
        .bind(&task.queue_name)
        .bind(task.scheduled_execution_utc)
        .bind(task.last_execution_utc)
        .bind(task.current_run_count as i32)
        .bind(recurring_json)
        .bind(task.max_runs.map(|v| v as i32))
        .bind(task.run_until_utc)
        .bind(&task.task_key)
        .bind(audit_level_str(task.audit_level))
        .bind(task.created_at_utc)
        .bind(&task.exception)
        .execute(&self.pool)
        .await?;
        Ok(task.id)
    }

    async fn get(&self, id: TaskId) -> StorageResult<Option<PersistedTask>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_task(&r)).transpose()?)
    }

    async fn get_by_task_key(&self, key: &str) -> StorageResult<Option<PersistedTask>> {
        let row = sqlx::query(
            "SELECT * FROM tasks WHERE task_key = $1 \
             AND status NOT IN ('completed','failed','cancelled','service_stopped')",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Self::row_to_task(&r)).transpose()?)
    }

    async fn set_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        exception: Option<String>,
        audit_level: AuditLevel,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET status = $1, exception = COALESCE($2, exception) WHERE id = $3")
            .bind(status_str(new_status))
            .bind(&exception)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if audit_level.records_status(new_status) {
            sqlx::query(
                "INSERT INTO status_audit (task_id, new_status, changed_at_utc, exception) \
                 VALUES ($1,$2,$3,$4)",
            )
            .bind(id)
            .bind(status_str(new_status))
            .bind(Utc::now())
            .bind(&exception)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_current_run(
        &self,
        id: TaskId,
        new_run_count: u32,
        next_scheduled_utc: Option<DateTime<Utc>>,
        last_execution_utc: DateTime<Utc>,
        audit_level: AuditLevel,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let status = parse_status(&row.try_get::<String, _>("status")?);

        sqlx::query(
            "UPDATE tasks SET current_run_count = $1, scheduled_execution_utc = $2, \
             last_execution_utc = $3 WHERE id = $4",
        )
        .bind(new_run_count as i32)
        .bind(next_scheduled_utc)
        .bind(last_execution_utc)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if audit_level.records_run() {
            sqlx::query(
                "INSERT INTO run_audit (task_id, execution_started_utc, execution_completed_utc, status, exception) \
                 VALUES ($1,$2,$3,$4,NULL)",
            )
            .bind(id)
            .bind(last_execution_utc)
            .bind(Utc::now())
            .bind(status_str(status))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending_on_startup(&self) -> StorageResult<Vec<PersistedTask>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN ('waiting_queue','queued','in_progress') \
             OR (recurring_info IS NOT NULL AND scheduled_execution_utc > $1)",
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn record_skipped_occurrences(
        &self,
        id: TaskId,
        skipped: Vec<DateTime<Utc>>,
    ) -> StorageResult<()> {
        if skipped.is_empty() {
            return Ok(());
        }
        let message = skipped
            .iter()
            .map(|t| t.to_rfc3339())
            .collect::<Vec<_>>()
            .join(", ");
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO run_audit (task_id, execution_started_utc, execution_completed_utc, status, exception) \
             VALUES ($1,$2,$3,'completed',$4)",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(format!("Skipped {} missed occurrence(s): [{}]", skipped.len(), message))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_execution_logs(&self, id: TaskId, entries: Vec<ExecutionLogEntry>) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO execution_logs (task_id, sequence, timestamp_utc, level, message, exception) \
                 VALUES ($1,$2,$3,$4,$5,$6)",
            )
            .bind(id)
            .bind(entry.sequence as i32)
            .bind(entry.timestamp_utc)
            .bind(log_level_str(entry.level))
            .bind(&entry.message)
            .bind(&entry.exception)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, id: TaskId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'cancelled' \
             WHERE id = $1 AND status NOT IN ('completed','failed','cancelled','service_stopped')",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() > 0 {
            sqlx::query(
                "INSERT INTO status_audit (task_id, new_status, changed_at_utc, exception) \
                 VALUES ($1,'cancelled',$2,NULL)",
            )
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> StorageResult<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

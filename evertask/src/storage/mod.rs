//! The storage contract (spec §4.1, §6.2).
//!
//! Deliberately thin and backend-agnostic, the same "policy-light
//! interfaces only" stance the teacher's `seesaw_core::job::JobStore`
//! trait takes (`packages/seesaw-rs/src/job.rs`): the engine only ever
//! programs against [`TaskStorage`], never against a concrete driver.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod sqlx_backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{AuditLevel, ExecutionLogEntry, PersistedTask, TaskId, TaskStatus};

pub type StorageResult<T> = anyhow::Result<T>;

/// Durable persistence for tasks and their audit trail (spec §4.1).
///
/// Every operation may fail with a transient I/O error, which
/// implementations propagate as-is; the engine decides how to react
/// (surface to the dispatch caller, log-and-drop, or best-effort retry)
/// per the propagation policy in spec.md §7.
#[async_trait]
pub trait TaskStorage: Send + Sync {
    /// Insert a new task row. For keyed (`task_key`) recurring
    /// registrations, idempotency handling (spec §4.9.1) happens in the
    /// dispatcher, not here — by the time `persist` is called, the
    /// dispatcher has already decided this is genuinely a new row.
    async fn persist(&self, task: PersistedTask) -> StorageResult<TaskId>;

    async fn get(&self, id: TaskId) -> StorageResult<Option<PersistedTask>>;

    async fn get_by_task_key(&self, key: &str) -> StorageResult<Option<PersistedTask>>;

    /// Atomically transitions `id` to `new_status`, conditionally
    /// recording a [`crate::model::StatusAuditEntry`] per `audit_level`
    /// (spec §3.3, §4.8 step 1/3).
    async fn set_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        exception: Option<String>,
        audit_level: AuditLevel,
    ) -> StorageResult<()>;

    /// Atomically records a completed run and the next occurrence (if
    /// any), conditionally appending a [`crate::model::RunAuditEntry`]
    /// (spec §4.8 step 4).
    async fn update_current_run(
        &self,
        id: TaskId,
        new_run_count: u32,
        next_scheduled_utc: Option<DateTime<Utc>>,
        last_execution_utc: DateTime<Utc>,
        audit_level: AuditLevel,
    ) -> StorageResult<()>;

    /// Every task storage must reconsider at startup: `WaitingQueue`,
    /// `Queued`, or `InProgress` rows, plus any recurring task with a
    /// future `scheduled_execution_utc` (spec §4.1).
    async fn pending_on_startup(&self) -> StorageResult<Vec<PersistedTask>>;

    async fn record_skipped_occurrences(
        &self,
        id: TaskId,
        skipped: Vec<DateTime<Utc>>,
    ) -> StorageResult<()>;

    async fn save_execution_logs(&self, id: TaskId, entries: Vec<ExecutionLogEntry>) -> StorageResult<()>;

    /// Transitions to `Cancelled` iff the task is not yet terminal; a
    /// no-op (not an error) if it already is.
    async fn cancel(&self, id: TaskId) -> StorageResult<()>;

    /// Removes a task row outright. Used by the dispatcher when a keyed
    /// re-dispatch finds the existing registration in a terminal state
    /// (spec §4.9.1: "remove the old record and create a new one").
    async fn delete(&self, id: TaskId) -> StorageResult<()>;

    /// Refreshes a lease/liveness marker for a long-running execution so
    /// concrete backends that reclaim stale `InProgress` rows don't treat
    /// it as abandoned mid-run. The abstract contract has no lease
    /// concept of its own; backends that don't need one simply no-op.
    async fn heartbeat(&self, _id: TaskId) -> StorageResult<()> {
        Ok(())
    }
}

//! In-memory [`TaskStorage`] backend.
//!
//! Modeled directly on the teacher's `TestJobManager`
//! (`kernel/jobs/manager.rs`): an `RwLock`-guarded `HashMap` plus a
//! parallel history map, used both for engine tests and as a real
//! (non-durable) backend for single-process deployments that don't need
//! crash recovery.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{StorageResult, TaskStorage};
use crate::model::{
    AuditLevel, ExecutionLogEntry, PersistedTask, RunAuditEntry, StatusAuditEntry, TaskId, TaskStatus,
};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, PersistedTask>,
    status_audit: Vec<StatusAuditEntry>,
    run_audit: Vec<RunAuditEntry>,
    execution_logs: Vec<ExecutionLogEntry>,
    heartbeats: HashMap<TaskId, u32>,
}

/// A non-durable, process-local [`TaskStorage`].
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Snapshot of every task currently held, for test assertions.
    pub fn all_tasks(&self) -> Vec<PersistedTask> {
        self.inner.read().unwrap().tasks.values().cloned().collect()
    }

    pub fn status_audit_for(&self, id: TaskId) -> Vec<StatusAuditEntry> {
        self.inner
            .read()
            .unwrap()
            .status_audit
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect()
    }

    pub fn run_audit_for(&self, id: TaskId) -> Vec<RunAuditEntry> {
        self.inner
            .read()
            .unwrap()
            .run_audit
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect()
    }

    pub fn execution_logs_for(&self, id: TaskId) -> Vec<ExecutionLogEntry> {
        self.inner
            .read()
            .unwrap()
            .execution_logs
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect()
    }

    /// Number of heartbeats recorded for `id`, for tests asserting a
    /// long-running execution kept its lease alive.
    pub fn heartbeat_count(&self, id: TaskId) -> u32 {
        self.inner.read().unwrap().heartbeats.get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TaskStorage for InMemoryStorage {
    async fn persist(&self, task: PersistedTask) -> StorageResult<TaskId> {
        let id = task.id;
        self.inner.write().unwrap().tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> StorageResult<Option<PersistedTask>> {
        Ok(self.inner.read().unwrap().tasks.get(&id).cloned())
    }

    async fn get_by_task_key(&self, key: &str) -> StorageResult<Option<PersistedTask>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .tasks
            .values()
            .find(|t| t.task_key.as_deref() == Some(key) && !t.status.is_terminal())
            .cloned())
    }

    async fn set_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        exception: Option<String>,
        audit_level: AuditLevel,
    ) -> StorageResult<()> {
        let mut guard = self.inner.write().unwrap();
        if let Some(task) = guard.tasks.get_mut(&id) {
            task.status = new_status;
            if exception.is_some() {
                task.exception = exception.clone();
            }
            if audit_level.records_status(new_status) {
                let mut entry = StatusAuditEntry::new(id, new_status);
                if let Some(exc) = exception {
                    entry = entry.with_exception(exc);
                }
                guard.status_audit.push(entry);
            }
        }
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
        let mut guard = self.inner.write().unwrap();
        let status = if let Some(task) = guard.tasks.get_mut(&id) {
            task.current_run_count = new_run_count;
            task.scheduled_execution_utc = next_scheduled_utc;
            task.last_execution_utc = Some(last_execution_utc);
            task.status
        } else {
            return Ok(());
        };
        if audit_level.records_run() {
            guard.run_audit.push(RunAuditEntry {
                task_id: id,
                execution_started_utc: last_execution_utc,
                execution_completed_utc: Utc::now(),
                status,
                exception: None,
            });
        }
        Ok(())
    }

    async fn pending_on_startup(&self) -> StorageResult<Vec<PersistedTask>> {
        let guard = self.inner.read().unwrap();
        Ok(guard
            .tasks
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::WaitingQueue | TaskStatus::Queued | TaskStatus::InProgress
                ) || (t.is_recurring() && t.scheduled_execution_utc.is_some_and(|d| d > Utc::now()))
            })
            .cloned()
            .collect())
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
        self.inner.write().unwrap().run_audit.push(RunAuditEntry {
            task_id: id,
            execution_started_utc: now,
            execution_completed_utc: now,
            status: TaskStatus::Completed,
            exception: Some(format!("Skipped {} missed occurrence(s): [{}]", skipped.len(), message)),
        });
        Ok(())
    }

    async fn save_execution_logs(&self, id: TaskId, entries: Vec<ExecutionLogEntry>) -> StorageResult<()> {
        let mut guard = self.inner.write().unwrap();
        guard.execution_logs.extend(entries.into_iter().map(|mut e| {
            e.task_id = id;
            e
        }));
        Ok(())
    }

    async fn cancel(&self, id: TaskId) -> StorageResult<()> {
        let mut guard = self.inner.write().unwrap();
        if let Some(task) = guard.tasks.get_mut(&id) {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                guard.status_audit.push(StatusAuditEntry::new(id, TaskStatus::Cancelled));
            }
        }
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> StorageResult<()> {
        self.inner.write().unwrap().tasks.remove(&id);
        Ok(())
    }

    async fn heartbeat(&self, id: TaskId) -> StorageResult<()> {
        *self.inner.write().unwrap().heartbeats.entry(id).or_insert(0) += 1;
        Ok(())
    }
}

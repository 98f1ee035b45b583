//! Status and execution history recorded alongside a [`super::PersistedTask`].
//!
//! The three entry kinds mirror the three things the teacher's
//! `JobEvent` enum distinguishes (status transition, run completion, and
//! free-form log line) but are persisted rows rather than bus events,
//! since spec.md's storage contract has no event-bus counterpart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus};

/// One row per status transition, gated by [`super::AuditLevel::records_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAuditEntry {
    pub task_id: TaskId,
    pub new_status: TaskStatus,
    pub changed_at_utc: DateTime<Utc>,
    pub exception: Option<String>,
}

impl StatusAuditEntry {
    pub fn new(task_id: TaskId, new_status: TaskStatus) -> Self {
        Self {
            task_id,
            new_status,
            changed_at_utc: Utc::now(),
            exception: None,
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

/// One row per completed execution attempt, gated by
/// [`super::AuditLevel::records_run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAuditEntry {
    pub task_id: TaskId,
    pub execution_started_utc: DateTime<Utc>,
    pub execution_completed_utc: DateTime<Utc>,
    pub status: TaskStatus,
    pub exception: Option<String>,
}

impl RunAuditEntry {
    pub fn duration(&self) -> chrono::Duration {
        self.execution_completed_utc - self.execution_started_utc
    }
}

/// Severity of an [`ExecutionLogEntry`], matching `tracing`'s levels so
/// handler-emitted log lines and engine-emitted ones share one vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A free-form line a handler or the engine attaches to a specific run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub task_id: TaskId,
    pub sequence: u32,
    pub timestamp_utc: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub exception: Option<String>,
}

impl ExecutionLogEntry {
    pub fn new(task_id: TaskId, sequence: u32, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id,
            sequence,
            timestamp_utc: Utc::now(),
            level,
            message: message.into(),
            exception: None,
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_entry_carries_no_exception_by_default() {
        let entry = StatusAuditEntry::new(TaskId::nil(), TaskStatus::Queued);
        assert!(entry.exception.is_none());
    }

    #[test]
    fn status_entry_with_exception_sets_it() {
        let entry = StatusAuditEntry::new(TaskId::nil(), TaskStatus::Failed).with_exception("boom");
        assert_eq!(entry.exception.as_deref(), Some("boom"));
    }

    #[test]
    fn run_entry_duration_is_non_negative() {
        let start = Utc::now();
        let entry = RunAuditEntry {
            task_id: TaskId::nil(),
            execution_started_utc: start,
            execution_completed_utc: start + chrono::Duration::milliseconds(250),
            status: TaskStatus::Completed,
            exception: None,
        };
        assert_eq!(entry.duration(), chrono::Duration::milliseconds(250));
    }
}

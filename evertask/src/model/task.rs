//! The canonical durable task record (spec §3.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::schedule::RecurringSchedule;

/// Opaque, temporally ordered task identifier.
///
/// Backed by a UUIDv7 so storage drivers that index on `id` get
/// index-friendly, roughly time-sorted inserts for free, the same
/// property the teacher relies on by generating ids with `Uuid::now_v7`
/// style helpers rather than pure-random v4 ids for append-heavy tables.
pub type TaskId = Uuid;

/// Lifecycle status of a [`PersistedTask`] (spec §3.1, §4.8 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    WaitingQueue,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    ServiceStopped,
}

impl TaskStatus {
    /// Terminal statuses per the GLOSSARY: no further transition happens
    /// from these without creating a new task row.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::ServiceStopped
        )
    }
}

/// Controls how much status/run history is persisted for a task (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    #[default]
    Full,
    Minimal,
    ErrorsOnly,
    None,
}

impl AuditLevel {
    /// Whether a status transition into `new_status` should produce a
    /// [`crate::model::StatusAuditEntry`] under this level.
    pub fn records_status(self, new_status: TaskStatus) -> bool {
        match self {
            AuditLevel::Full => true,
            AuditLevel::Minimal => new_status.is_terminal(),
            AuditLevel::ErrorsOnly => matches!(new_status, TaskStatus::Failed),
            AuditLevel::None => false,
        }
    }

    /// Whether a run completion should produce a [`crate::model::RunAuditEntry`].
    pub fn records_run(self) -> bool {
        !matches!(self, AuditLevel::None)
    }
}

/// The canonical durable record for a unit of work (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PersistedTask {
    #[builder(default = Uuid::now_v7())]
    pub id: TaskId,

    /// Fully-qualified task-payload type name.
    pub task_type: String,
    /// Fully-qualified handler type name.
    pub handler_type: String,
    /// Opaque serialized task request payload.
    pub payload: String,

    #[builder(default)]
    pub status: TaskStatus,

    #[builder(default = "default".to_string())]
    pub queue_name: String,

    #[builder(default, setter(strip_option))]
    pub scheduled_execution_utc: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_execution_utc: Option<DateTime<Utc>>,

    #[builder(default = 0)]
    pub current_run_count: u32,

    #[builder(default, setter(strip_option))]
    pub recurring_info: Option<RecurringSchedule>,
    #[builder(default, setter(strip_option))]
    pub max_runs: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub run_until_utc: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub task_key: Option<String>,

    #[builder(default)]
    pub audit_level: AuditLevel,

    #[builder(default = Utc::now())]
    pub created_at_utc: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub exception: Option<String>,
}

impl PersistedTask {
    /// True if this is a recurring registration (spec §3.2).
    pub fn is_recurring(&self) -> bool {
        self.recurring_info.is_some()
    }

    /// Whether `current_run_count + 1` would exceed the recurring stop
    /// condition, if any (spec §4.8 step 4).
    pub fn exceeds_max_runs(&self, next_run_count: u32) -> bool {
        self.max_runs.is_some_and(|m| next_run_count > m)
    }

    /// Whether `candidate` is past the `run_until_utc` stop condition, if any.
    pub fn past_run_until(&self, candidate: DateTime<Utc>) -> bool {
        self.run_until_utc.is_some_and(|until| candidate > until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedTask {
        PersistedTask::builder()
            .task_type("evertask::examples::SendEmail")
            .handler_type("evertask::examples::SendEmailHandler")
            .payload("{}")
            .build()
    }

    #[test]
    fn new_task_starts_waiting_queue() {
        assert_eq!(sample().status, TaskStatus::WaitingQueue);
    }

    #[test]
    fn new_task_defaults_to_default_queue() {
        assert_eq!(sample().queue_name, "default");
    }

    #[test]
    fn new_task_is_not_recurring() {
        assert!(!sample().is_recurring());
    }

    #[test]
    fn terminal_statuses_are_exactly_four() {
        for s in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::ServiceStopped,
        ] {
            assert!(s.is_terminal());
        }
        for s in [TaskStatus::WaitingQueue, TaskStatus::Queued, TaskStatus::InProgress] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn audit_level_none_records_nothing() {
        assert!(!AuditLevel::None.records_status(TaskStatus::Failed));
        assert!(!AuditLevel::None.records_run());
    }

    #[test]
    fn audit_level_errors_only_records_failed() {
        assert!(AuditLevel::ErrorsOnly.records_status(TaskStatus::Failed));
        assert!(!AuditLevel::ErrorsOnly.records_status(TaskStatus::Completed));
    }

    #[test]
    fn audit_level_minimal_records_terminal_only() {
        assert!(AuditLevel::Minimal.records_status(TaskStatus::Cancelled));
        assert!(!AuditLevel::Minimal.records_status(TaskStatus::Queued));
    }

    #[test]
    fn exceeds_max_runs_respects_limit() {
        let task = PersistedTask::builder()
            .task_type("t")
            .handler_type("h")
            .payload("{}")
            .max_runs(3u32)
            .build();
        assert!(!task.exceeds_max_runs(3));
        assert!(task.exceeds_max_runs(4));
    }
}

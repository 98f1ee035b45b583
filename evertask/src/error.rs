//! Error types for the EverTask engine.

use uuid::Uuid;

/// Errors the engine can return to a direct caller.
///
/// Errors that occur *after* a task has been accepted (storage hiccups
/// during status updates, handler panics, timeouts, ...) never reach this
/// type — they are logged, audited, and folded into a terminal task
/// status instead.
#[derive(Debug, thiserror::Error)]
pub enum EverTaskError {
    /// The storage backend failed on a synchronous persist/route call.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// No handler is registered for this task/handler type.
    #[error("no handler registered for task type {0:?}")]
    HandlerNotRegistered(String),

    /// A bounded worker queue rejected the task under `ThrowOnFull`.
    #[error("queue {0:?} is full")]
    QueueFull(String),

    /// A handler did not complete within its configured timeout.
    #[error("task execution timed out")]
    Timeout,

    /// A handler was cancelled cooperatively before it completed.
    #[error("task execution was cancelled")]
    Cancelled,

    /// The recurring schedule descriptor is misconfigured: it could not
    /// produce a next occurrence at all (e.g. a zero-period step), as
    /// distinct from legitimately exhausting `max_runs`/`run_until_utc`.
    #[error("invalid recurring schedule: {0}")]
    InvalidSchedule(String),

    /// A `task_key` exceeds the 200-character limit or is otherwise malformed.
    #[error("invalid task key: {0}")]
    InvalidTaskKey(String),

    /// Attempted to cancel or look up a task id storage doesn't know about.
    #[error("task {0} not found")]
    NotFound(Uuid),

    /// Retry policy exhausted all attempts.
    #[error("retry policy exhausted after {attempts} attempt(s): {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, EverTaskError>;

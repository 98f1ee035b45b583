//! The executor: timeout, retry, lifecycle hooks, and drift-free
//! recurring continuation (spec §4.8).
//!
//! Grounded on the teacher's `execute_with_heartbeat` /
//! `process_job` pair (`kernel/jobs/worker.rs`) for the overall
//! "transition to running, run the work, transition to a terminal
//! status, never let an error escape" shape, and on `runner.rs`'s
//! `classify_error` for separating retryable from terminal outcomes —
//! generalized to spec.md's five-way outcome split (success, failure,
//! user-cancel, shutdown-cancel, timeout) and its recurring-continuation
//! step, which the teacher's one-shot job model doesn't have.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::error::EverTaskError;
use crate::handler::HandlerRegistry;
use crate::model::{AuditLevel, ExecutionLogEntry, LogLevel, PersistedTask, TaskId, TaskStatus};
use crate::queue::ScheduledHandle;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::storage::TaskStorage;

/// Per-run buffer of [`ExecutionLogEntry`] rows, flushed once the task
/// leaves `InProgress` (spec §4.8 step 5). Capped at
/// [`EngineConfig::execution_log_cap`]; entries past the cap are dropped
/// from storage but still forwarded to `tracing` at the call site, since
/// that forwarding happens independently of this buffer.
struct LogBuffer {
    task_id: TaskId,
    cap: usize,
    sequence: AtomicU32,
    entries: Mutex<Vec<ExecutionLogEntry>>,
}

impl LogBuffer {
    fn new(task_id: TaskId, cap: usize) -> Self {
        LogBuffer {
            task_id,
            cap,
            sequence: AtomicU32::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, level: LogLevel, message: impl Into<String>) {
        let mut guard = self.entries.lock().unwrap();
        if guard.len() >= self.cap {
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        guard.push(ExecutionLogEntry::new(self.task_id, sequence, level, message));
    }

    fn into_entries(self) -> Vec<ExecutionLogEntry> {
        self.entries.into_inner().unwrap()
    }
}

/// Runs dequeued task handles to completion, enforcing timeout and retry
/// policy and driving the executor state machine in spec §4.8.
pub struct Executor {
    storage: Arc<dyn TaskStorage>,
    registry: Arc<HandlerRegistry>,
    scheduler: Arc<Scheduler>,
    config: Arc<EngineConfig>,
    /// Per-task user-cancellation signals for tasks currently executing
    /// (spec §5 "user-initiated cancel during InProgress signals the
    /// handler"). Entries are removed once the execution ends.
    in_flight: DashMap<TaskId, CancellationToken>,
}

impl Executor {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        registry: Arc<HandlerRegistry>,
        scheduler: Arc<Scheduler>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Executor {
            storage,
            registry,
            scheduler,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Signals user cancellation to a task currently `InProgress`.
    /// Returns `false` if the task isn't (or is no longer) executing —
    /// the dispatcher falls back to scheduler/queue removal in that case.
    pub fn cancel_in_flight(&self, id: TaskId) -> bool {
        match self.in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs one dequeued handle end to end. Never panics or propagates an
    /// error — every failure mode is logged, audited, and folded into a
    /// terminal task status (spec §7 propagation policy).
    pub async fn execute(&self, handle: ScheduledHandle, shutdown: CancellationToken) {
        let id = handle.task_id;
        async move {
            let Some(task) = self.load_task(id).await else {
                return;
            };

            let Some(resolved) = self.registry.resolve(&task.handler_type) else {
                error!(task.handler_type = %task.handler_type, "no handler registered");
                self.try_set_status(
                    id,
                    TaskStatus::Failed,
                    Some(format!("no handler registered for {}", task.handler_type)),
                    task.audit_level,
                )
                .await;
                return;
            };

            let user_cancel = CancellationToken::new();
            // Guards against a second handle for the same task_id landing in a
            // worker concurrently with one already running (dispatcher::dispatch_keyed's
            // Queued-redispatch race: the scheduler can't retract a handle that's
            // already past it and sitting in a bounded queue's channel). Claim is
            // atomic so two workers racing on the same id can't both proceed.
            let claimed = match self.in_flight.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(user_cancel.clone());
                    true
                }
            };
            if !claimed {
                warn!(task.id = %id, "dropping duplicate in-flight handle; task already executing");
                return;
            }

            let exec_cancel = shutdown.child_token();
            let done = CancellationToken::new();
            let watcher = {
                let exec_cancel = exec_cancel.clone();
                let user_cancel = user_cancel.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = user_cancel.cancelled() => exec_cancel.cancel(),
                        _ = exec_cancel.cancelled() => {}
                        _ = done.cancelled() => {}
                    }
                })
            };

            self.run_one(&task, &resolved, exec_cancel.clone(), &shutdown, &user_cancel)
                .await;

            done.cancel();
            let _ = watcher.await;
            self.in_flight.remove(&id);
            resolved.dispose().await;
        }
        .instrument(info_span!("execute_task", task.id = %id))
        .await
    }

    /// Periodically calls `storage.heartbeat` while a task is executing,
    /// so a lease-based storage backend doesn't reclaim a still-running
    /// task (SPEC_FULL.md §E). Skips the first immediate tick: a
    /// freshly-started task doesn't need its lease renewed before it's
    /// had a chance to run for `heartbeat_interval`.
    fn spawn_heartbeat(&self, id: TaskId, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let storage = self.storage.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = storage.heartbeat(id).await {
                            warn!(task.id = %id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn load_task(&self, id: TaskId) -> Option<PersistedTask> {
        match self.storage.get(id).await {
            Ok(Some(task)) => Some(task),
            Ok(None) => {
                warn!(task.id = %id, "dequeued handle has no matching task row");
                None
            }
            Err(err) => {
                error!(task.id = %id, error = %err, "failed to load task before execution");
                None
            }
        }
    }

    /// Steps 1-4 of spec §4.8 for a single resolved execution.
    async fn run_one(
        &self,
        task: &PersistedTask,
        resolved: &crate::handler::ResolvedHandler,
        exec_cancel: CancellationToken,
        shutdown: &CancellationToken,
        user_cancel: &CancellationToken,
    ) {
        let id = task.id;
        let run_started = Utc::now();
        let log = LogBuffer::new(id, self.config.execution_log_cap);

        self.try_set_status(id, TaskStatus::InProgress, None, task.audit_level).await;
        resolved.on_started(id).await;
        log.push(LogLevel::Info, "execution started");

        let retry_policy = resolved.retry_policy().unwrap_or_else(|| self.config.retry_policy_for(&task.queue_name));
        let timeout = resolved.timeout().or_else(|| self.config.timeout_for(&task.queue_name));

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_handle = self.spawn_heartbeat(id, heartbeat_cancel.clone());

        let outcome = run_with_timeout(&retry_policy, &exec_cancel, timeout, resolved, &task.payload, id, &log).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat_handle.await;

        match outcome {
            RunOutcome::Success => {
                log.push(LogLevel::Info, "execution completed successfully");
                self.try_set_status(id, TaskStatus::Completed, None, task.audit_level).await;
                resolved.on_completed(id).await;
                if task.is_recurring() {
                    self.schedule_next_occurrence(task, run_started, &log).await;
                }
            }
            RunOutcome::Failed(err) => {
                let message = err.to_string();
                warn!(task.id = %id, error = %message, "task execution failed");
                log.push(LogLevel::Error, format!("execution failed: {message}"));
                self.try_set_status(id, TaskStatus::Failed, Some(message.clone()), task.audit_level)
                    .await;
                resolved.on_error(id, Some(&err), Some(&message)).await;
            }
            RunOutcome::TimedOut => {
                let message = "task execution timed out".to_string();
                warn!(task.id = %id, timeout = ?timeout, "task execution timed out");
                log.push(LogLevel::Error, message.clone());
                self.try_set_status(id, TaskStatus::Failed, Some(message.clone()), task.audit_level)
                    .await;
                let timeout_err: anyhow::Error = EverTaskError::Timeout.into();
                resolved.on_error(id, Some(&timeout_err), Some(&message)).await;
            }
            RunOutcome::Cancelled => {
                if shutdown.is_cancelled() {
                    debug!(task.id = %id, "execution interrupted by engine shutdown");
                    log.push(LogLevel::Warn, "execution interrupted by engine shutdown");
                    self.try_set_status(id, TaskStatus::ServiceStopped, None, task.audit_level).await;
                } else if user_cancel.is_cancelled() {
                    debug!(task.id = %id, "execution cancelled by caller");
                    log.push(LogLevel::Info, "execution cancelled by caller");
                    self.try_set_status(id, TaskStatus::Cancelled, None, task.audit_level).await;
                } else {
                    // Retry policy itself raised Cancelled (e.g. its own
                    // internal wait loop observed a cancel) without either
                    // flag set yet; treat as a shutdown race and default
                    // to the safer, recoverable terminal status.
                    log.push(LogLevel::Warn, "execution cancelled for an unattributed reason; treating as shutdown");
                    self.try_set_status(id, TaskStatus::ServiceStopped, None, task.audit_level).await;
                }
            }
        }

        // Flush once the task has left InProgress (spec §4.8 step 5).
        if let Err(err) = self.storage.save_execution_logs(id, log.into_entries()).await {
            error!(task.id = %id, error = %err, "failed to flush execution logs");
        }
    }

    /// Recurring continuation (spec §4.8 step 4): compute the next valid
    /// occurrence from the scheduled (not actual) time of this run, audit
    /// any skipped occurrences, and resubmit to the scheduler if the
    /// recurring task's stop conditions allow it.
    async fn schedule_next_occurrence(&self, task: &PersistedTask, run_started: chrono::DateTime<Utc>, log: &LogBuffer) {
        let Some(descriptor) = &task.recurring_info else {
            return;
        };
        let id = task.id;
        let base = task.scheduled_execution_utc.unwrap_or(run_started);
        let now = Utc::now();
        let (next, skipped) = descriptor.next_valid(base, now);

        if !skipped.is_empty() {
            info!(task.id = %id, skipped = skipped.len(), "recurring task skipped missed occurrence(s)");
            log.push(LogLevel::Warn, format!("skipped {} missed occurrence(s)", skipped.len()));
            if let Err(err) = self.storage.record_skipped_occurrences(id, skipped).await {
                error!(task.id = %id, error = %err, "failed to record skipped occurrences");
            }
        }

        let new_run_count = task.current_run_count + 1;
        if let Err(err) = self
            .storage
            .update_current_run(id, new_run_count, next, run_started, task.audit_level)
            .await
        {
            error!(task.id = %id, error = %err, "failed to persist recurring run update");
            return;
        }

        match next {
            None => {
                // next_valid only returns None when the descriptor itself can't
                // compute a next occurrence at all (e.g. a zero-period step or a
                // calendar date that never occurs); max_runs/run_until exhaustion
                // is checked below against a real `Some(next)`. That's
                // misconfiguration, not a stop condition, so the task fails rather
                // than looking like an ordinary successful completion.
                let err = EverTaskError::InvalidSchedule(format!(
                    "recurring schedule produced no next occurrence past {base}"
                ));
                warn!(task.id = %id, error = %err, "recurring schedule misconfigured; failing task");
                log.push(LogLevel::Error, err.to_string());
                self.try_set_status(id, TaskStatus::Failed, Some(err.to_string()), task.audit_level)
                    .await;
            }
            Some(next) => {
                let continues = !task.exceeds_max_runs(new_run_count) && !task.past_run_until(next);
                if continues {
                    self.try_set_status(id, TaskStatus::WaitingQueue, None, task.audit_level).await;
                    self.scheduler.submit(ScheduledHandle {
                        task_id: id,
                        due: next,
                        queue_name: task.queue_name.clone(),
                        audit_level: task.audit_level,
                    });
                } else {
                    debug!(task.id = %id, "recurring task reached its stop condition");
                }
            }
        }
    }

    /// Best-effort status update: failures are logged, not retried
    /// further here — storage errors during status updates never crash
    /// the engine (spec §4.8 failure semantics summary).
    async fn try_set_status(&self, id: TaskId, status: TaskStatus, exception: Option<String>, audit_level: AuditLevel) {
        if let Err(err) = self
            .storage
            .set_status(id, status, exception.clone(), audit_level)
            .await
        {
            error!(task.id = %id, error = %err, "failed to persist status transition, retrying once");
            if let Err(err) = self.storage.set_status(id, status, exception, audit_level).await {
                error!(task.id = %id, error = %err, "status transition persist failed twice, dropping");
            }
        }
    }
}

enum RunOutcome {
    Success,
    Failed(anyhow::Error),
    TimedOut,
    Cancelled,
}

async fn run_with_timeout(
    retry_policy: &RetryPolicy,
    exec_cancel: &CancellationToken,
    timeout: Option<StdDuration>,
    resolved: &crate::handler::ResolvedHandler,
    payload: &str,
    id: TaskId,
    log: &LogBuffer,
) -> RunOutcome {
    let attempt_body = retry_policy.execute(
        exec_cancel,
        || {
            let cancel = exec_cancel.clone();
            async move { resolved.handle(payload, cancel).await }
        },
        |attempt, error, delay| async move {
            log.push(
                LogLevel::Warn,
                format!("retry attempt {attempt} scheduled after {delay:?}: {error}"),
            );
            resolved.on_retry(id, attempt, error, delay).await;
        },
    );

    let result = match timeout {
        Some(duration) => match tokio::time::timeout(duration, attempt_body).await {
            Ok(result) => result,
            Err(_) => return RunOutcome::TimedOut,
        },
        None => attempt_body.await,
    };

    match result {
        Ok(()) => RunOutcome::Success,
        Err(err) => match err.downcast_ref::<EverTaskError>() {
            Some(EverTaskError::Cancelled) => RunOutcome::Cancelled,
            Some(EverTaskError::Timeout) => RunOutcome::TimedOut,
            _ => RunOutcome::Failed(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TaskHandler;
    use crate::schedule::RecurringSchedule;
    use crate::storage::memory::InMemoryStorage;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Noop;

    struct AlwaysOk;
    #[async_trait]
    impl TaskHandler<Noop> for AlwaysOk {
        async fn handle(&self, _task: Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl TaskHandler<Noop> for AlwaysFails {
        async fn handle(&self, _task: Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy::none())
        }
    }

    struct SleepsForever;
    #[async_trait]
    impl TaskHandler<Noop> for SleepsForever {
        async fn handle(&self, _task: Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }

        fn timeout(&self) -> Option<std::time::Duration> {
            Some(std::time::Duration::from_millis(20))
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy::none())
        }
    }

    fn setup(handler_type: &str) -> (Arc<InMemoryStorage>, Arc<HandlerRegistry>) {
        let _ = handler_type;
        (Arc::new(InMemoryStorage::new()), Arc::new(HandlerRegistry::new()))
    }

    async fn persisted(storage: &InMemoryStorage, handler_type: &str) -> TaskId {
        let task = PersistedTask::builder()
            .task_type(handler_type)
            .handler_type(handler_type)
            .payload("null")
            .status(TaskStatus::Queued)
            .build();
        storage.persist(task).await.unwrap()
    }

    fn handle(id: TaskId) -> ScheduledHandle {
        ScheduledHandle {
            task_id: id,
            due: Utc::now(),
            queue_name: "default".into(),
            audit_level: AuditLevel::Full,
        }
    }

    #[tokio::test]
    async fn success_transitions_to_completed() {
        let (storage, registry) = setup("ok");
        registry.register::<_, Noop>("ok", AlwaysOk);
        let id = persisted(&storage, "ok").await;
        let executor = Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        );
        executor.execute(handle(id), CancellationToken::new()).await;
        assert_eq!(storage.get(id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn no_retry_failure_transitions_to_failed() {
        let (storage, registry) = setup("fails");
        registry.register::<_, Noop>("fails", AlwaysFails);
        let id = persisted(&storage, "fails").await;
        let executor = Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        );
        executor.execute(handle(id), CancellationToken::new()).await;
        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.exception.is_some());
    }

    #[tokio::test]
    async fn s3_timeout_marks_failed_without_retry() {
        // spec.md S3: 100ms timeout, handler sleeps far longer, no retries configured.
        let (storage, registry) = setup("slow");
        registry.register::<_, Noop>("slow", SleepsForever);
        let id = persisted(&storage, "slow").await;
        let executor = Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        );
        executor.execute(handle(id), CancellationToken::new()).await;
        assert_eq!(storage.get(id).await.unwrap().unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn missing_handler_marks_failed() {
        let (storage, registry) = setup("unregistered");
        let id = persisted(&storage, "unregistered").await;
        let executor = Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        );
        executor.execute(handle(id), CancellationToken::new()).await;
        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.exception.as_deref().unwrap_or("").contains("no handler"));
    }

    #[tokio::test]
    async fn shutdown_marks_service_stopped() {
        let (storage, registry) = setup("slow2");
        registry.register::<_, Noop>("slow2", SleepsForever2);
        let id = persisted(&storage, "slow2").await;
        let executor = Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        );
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            shutdown_clone.cancel();
        });
        executor.execute(handle(id), shutdown).await;
        assert_eq!(
            storage.get(id).await.unwrap().unwrap().status,
            TaskStatus::ServiceStopped
        );
    }

    struct SleepsForever2;
    #[async_trait]
    impl TaskHandler<Noop> for SleepsForever2 {
        async fn handle(&self, _task: Noop, cancel: CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            Err(EverTaskError::Cancelled.into())
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy::none())
        }
    }

    #[tokio::test]
    async fn s1_recurring_success_reschedules_without_drift() {
        let (storage, registry) = setup("tick");
        registry.register::<_, Noop>("tick", AlwaysOk);
        let mut task = PersistedTask::builder()
            .task_type("tick")
            .handler_type("tick")
            .payload("null")
            .status(TaskStatus::Queued)
            .build();
        task.recurring_info = Some(RecurringSchedule::cron("0 * * * *").unwrap());
        task.scheduled_execution_utc = Some(chrono::Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());
        let id = storage.persist(task).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(1));
        let executor = Executor::new(storage.clone(), registry, scheduler.clone(), Arc::new(EngineConfig::default()));
        executor.execute(handle(id), CancellationToken::new()).await;

        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.current_run_count, 1);
        assert_eq!(task.status, TaskStatus::WaitingQueue);
        assert_eq!(scheduler.pending_count(), 1);
    }

    struct SleepsFor(StdDuration);
    #[async_trait]
    impl TaskHandler<Noop> for SleepsFor {
        async fn handle(&self, _task: Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy::none())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn long_execution_sends_periodic_heartbeats() {
        let (storage, registry) = setup("heartbeats");
        registry.register::<_, Noop>("heartbeats", SleepsFor(StdDuration::from_secs(100)));
        let id = persisted(&storage, "heartbeats").await;
        let config = EngineConfig::builder().heartbeat_interval(StdDuration::from_secs(10)).build();
        let executor = Executor::new(storage.clone(), registry, Arc::new(Scheduler::new(1)), Arc::new(config));

        let run = executor.execute(handle(id), CancellationToken::new());
        tokio::pin!(run);

        // Advance past several heartbeat ticks before the handler finishes.
        for _ in 0..5 {
            tokio::time::advance(StdDuration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }
        run.await;

        assert!(storage.heartbeat_count(id) >= 4, "expected several heartbeats over a 100s execution");
        assert_eq!(storage.get(id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn successful_run_flushes_execution_log_entries() {
        let (storage, registry) = setup("ok3");
        registry.register::<_, Noop>("ok3", AlwaysOk);
        let id = persisted(&storage, "ok3").await;
        let executor = Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        );
        executor.execute(handle(id), CancellationToken::new()).await;
        let logs = storage.execution_logs_for(id);
        assert!(logs.iter().any(|e| e.message.contains("execution started")));
        assert!(logs.iter().any(|e| e.message.contains("completed successfully")));
    }

    #[tokio::test]
    async fn execution_log_entries_are_capped() {
        let (storage, registry) = setup("ok4");
        registry.register::<_, Noop>("ok4", AlwaysOk);
        let id = persisted(&storage, "ok4").await;
        let config = EngineConfig::builder().execution_log_cap(1usize).build();
        let executor = Executor::new(storage.clone(), registry, Arc::new(Scheduler::new(1)), Arc::new(config));
        executor.execute(handle(id), CancellationToken::new()).await;
        assert_eq!(storage.execution_logs_for(id).len(), 1);
    }

    #[tokio::test]
    async fn cancel_in_flight_reports_false_when_not_executing() {
        let (storage, registry) = setup("ok2");
        registry.register::<_, Noop>("ok2", AlwaysOk);
        let executor = Executor::new(storage, registry, Arc::new(Scheduler::new(1)), Arc::new(EngineConfig::default()));
        assert!(!executor.cancel_in_flight(TaskId::now_v7()));
    }

    #[tokio::test]
    async fn misconfigured_zero_period_schedule_fails_the_task() {
        let (storage, registry) = setup("tick2");
        registry.register::<_, Noop>("tick2", AlwaysOk);
        let mut task = PersistedTask::builder()
            .task_type("tick2")
            .handler_type("tick2")
            .payload("null")
            .status(TaskStatus::Queued)
            .build();
        task.recurring_info = Some(RecurringSchedule::EverySeconds(0));
        let id = storage.persist(task).await.unwrap();

        let executor = Executor::new(storage.clone(), registry, Arc::new(Scheduler::new(1)), Arc::new(EngineConfig::default()));
        executor.execute(handle(id), CancellationToken::new()).await;

        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.exception.as_deref().unwrap_or("").contains("invalid recurring schedule"));
    }

    struct CountingSleeper {
        counter: Arc<AtomicU32>,
        sleep: StdDuration,
    }
    #[async_trait]
    impl TaskHandler<Noop> for CountingSleeper {
        async fn handle(&self, _task: Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.sleep).await;
            Ok(())
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy::none())
        }
    }

    #[tokio::test]
    async fn duplicate_handle_for_same_task_id_executes_at_most_once() {
        // Simulates dispatcher::dispatch_keyed's Queued-redispatch race: two
        // handles for the same task_id reach a worker concurrently.
        let (storage, registry) = setup("dup");
        let counter = Arc::new(AtomicU32::new(0));
        registry.register::<_, Noop>(
            "dup",
            CountingSleeper {
                counter: counter.clone(),
                sleep: StdDuration::from_millis(30),
            },
        );
        let id = persisted(&storage, "dup").await;
        let executor = Executor::new(storage.clone(), registry, Arc::new(Scheduler::new(1)), Arc::new(EngineConfig::default()));

        tokio::join!(
            executor.execute(handle(id), CancellationToken::new()),
            executor.execute(handle(id), CancellationToken::new()),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1, "handler body must run exactly once for a duplicated task_id");
        assert_eq!(storage.get(id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }
}

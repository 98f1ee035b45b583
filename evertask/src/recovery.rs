//! Recovery service: re-establishes ownership of tasks left pending or
//! in-progress by a prior process, before the engine accepts new
//! dispatches (spec §4.10).
//!
//! No direct teacher analog runs this exact sequence (the teacher's
//! `JobWorker` just polls `JobStore::claim_ready` continuously and treats
//! "still in the database" as the only recovery state it needs), but the
//! shape — walk every row storage considers still live, decide a target
//! by time and status, resubmit — follows the same "trust storage as the
//! source of truth at startup" posture as `Job::find_ready_jobs`
//! (`kernel/jobs/job.rs`).

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::model::{PersistedTask, TaskStatus};
use crate::queue::{QueueRegistry, ScheduledHandle};
use crate::scheduler::Scheduler;
use crate::storage::TaskStorage;

/// Re-enqueues pending and in-progress tasks from storage at startup
/// (spec §4.10). Runs once, before the dispatcher accepts new work.
pub struct RecoveryService {
    storage: Arc<dyn TaskStorage>,
    queues: Arc<QueueRegistry>,
    scheduler: Arc<Scheduler>,
}

impl RecoveryService {
    pub fn new(storage: Arc<dyn TaskStorage>, queues: Arc<QueueRegistry>, scheduler: Arc<Scheduler>) -> Self {
        RecoveryService { storage, queues, scheduler }
    }

    /// Walks every row `storage.pending_on_startup()` returns and decides
    /// where it belongs (spec §4.10):
    ///
    /// - `WaitingQueue`/`Queued` due now or in the past: straight to its
    ///   worker queue.
    /// - `WaitingQueue`/`Queued` due in the future: back to the scheduler.
    /// - `InProgress`: the prior process died mid-execution. Marked
    ///   `ServiceStopped` (at-least-once guarantee; handlers must be
    ///   idempotent) then re-queued.
    /// - Recurring tasks whose next occurrence has already passed: walked
    ///   forward past missed slots with the same drift-free skip
    ///   algorithm the executor uses, before resubmission.
    pub async fn run(&self) -> anyhow::Result<RecoveryReport> {
        let pending = self.storage.pending_on_startup().await?;
        let mut report = RecoveryReport::default();

        for task in pending {
            let was_in_progress = task.status == TaskStatus::InProgress;
            match self.recover_one(task).await {
                Ok(outcome) => report.record(outcome, was_in_progress),
                Err(err) => {
                    warn!(error = %err, "failed to recover a pending task; leaving it for the next startup");
                }
            }
        }

        info!(
            requeued_to_worker_queue = report.requeued_to_worker_queue,
            resubmitted_to_scheduler = report.resubmitted_to_scheduler,
            recovered_in_progress = report.recovered_in_progress,
            "recovery complete"
        );
        Ok(report)
    }

    async fn recover_one(&self, mut task: PersistedTask) -> anyhow::Result<RecoveryOutcome> {
        let id = task.id;
        let now = Utc::now();

        if task.status == TaskStatus::InProgress {
            self.storage
                .set_status(id, TaskStatus::ServiceStopped, None, task.audit_level)
                .await?;
            task.status = TaskStatus::ServiceStopped;
        }

        if task.is_recurring() {
            if let Some(scheduled) = task.scheduled_execution_utc {
                if scheduled < now {
                    if let Some(descriptor) = &task.recurring_info {
                        let (next, skipped) = descriptor.next_valid(scheduled, now);
                        if !skipped.is_empty() {
                            self.storage.record_skipped_occurrences(id, skipped).await?;
                        }
                        task.scheduled_execution_utc = next;
                    }
                }
            }
        }

        let Some(due) = task.scheduled_execution_utc else {
            // No schedule: an immediate task that was Queued/WaitingQueue
            // when the process died. Enqueue straight to its worker queue.
            self.queues
                .enqueue(
                    &task.queue_name,
                    ScheduledHandle {
                        task_id: id,
                        due: now,
                        queue_name: task.queue_name.clone(),
                        audit_level: task.audit_level,
                    },
                    &tokio_util::sync::CancellationToken::new(),
                )
                .await?;
            self.storage.set_status(id, TaskStatus::Queued, None, task.audit_level).await?;
            return Ok(RecoveryOutcome::RequeuedToWorkerQueue);
        };

        if due <= now {
            self.queues
                .enqueue(
                    &task.queue_name,
                    ScheduledHandle {
                        task_id: id,
                        due,
                        queue_name: task.queue_name.clone(),
                        audit_level: task.audit_level,
                    },
                    &tokio_util::sync::CancellationToken::new(),
                )
                .await?;
            self.storage.set_status(id, TaskStatus::Queued, None, task.audit_level).await?;
            Ok(RecoveryOutcome::RequeuedToWorkerQueue)
        } else {
            self.storage
                .set_status(id, TaskStatus::WaitingQueue, None, task.audit_level)
                .await?;
            self.scheduler.submit(ScheduledHandle {
                task_id: id,
                due,
                queue_name: task.queue_name.clone(),
                audit_level: task.audit_level,
            });
            Ok(RecoveryOutcome::ResubmittedToScheduler)
        }
    }
}

enum RecoveryOutcome {
    RequeuedToWorkerQueue,
    ResubmittedToScheduler,
}

/// Summary counters returned by [`RecoveryService::run`], useful for
/// startup logging and tests (spec property 8: "recovery re-queues").
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub requeued_to_worker_queue: usize,
    pub resubmitted_to_scheduler: usize,
    pub recovered_in_progress: usize,
}

impl RecoveryReport {
    fn record(&mut self, outcome: RecoveryOutcome, was_in_progress: bool) {
        match outcome {
            RecoveryOutcome::RequeuedToWorkerQueue => self.requeued_to_worker_queue += 1,
            RecoveryOutcome::ResubmittedToScheduler => self.resubmitted_to_scheduler += 1,
        }
        if was_in_progress {
            self.recovered_in_progress += 1;
        }
    }
}

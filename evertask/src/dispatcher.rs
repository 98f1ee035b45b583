//! Dispatcher: entry API for persisting and routing task requests, plus
//! cancellation and keyed idempotent (re-)registration (spec §4.9).
//!
//! `DispatchOptions` mirrors the teacher's `ScheduleOptions`
//! (`kernel/jobs/manager.rs`) — a `typed_builder` struct with
//! `immediate`/`scheduled`/`recurring` convenience constructors — scaled
//! up to cover spec.md's richer recurring-first-occurrence and keyed
//! idempotency rules that `ScheduleOptions` doesn't need.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::config::EngineConfig;
use crate::error::{EverTaskError, Result};
use crate::executor::Executor;
use crate::handler::HandlerRegistry;
use crate::model::{AuditLevel, PersistedTask, TaskId, TaskStatus};
use crate::queue::{QueueRegistry, ScheduledHandle};
use crate::schedule::{FirstOccurrence, RecurringSchedule};
use crate::scheduler::Scheduler;
use crate::storage::TaskStorage;

/// Per-dispatch overrides of the engine's routing and idempotency
/// behavior (spec §4.9).
#[derive(Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct DispatchOptions {
    pub delay: Option<StdDuration>,
    pub at: Option<DateTime<Utc>>,
    pub recurring: Option<(RecurringSchedule, FirstOccurrence)>,
    pub task_key: Option<String>,
    pub audit_level: Option<AuditLevel>,
    pub queue_name: Option<String>,
    pub max_runs: Option<u32>,
    pub run_until_utc: Option<DateTime<Utc>>,
}

impl DispatchOptions {
    pub fn immediate() -> Self {
        DispatchOptions::default()
    }

    pub fn delayed(delay: StdDuration) -> Self {
        DispatchOptions::builder().delay(delay).build()
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        DispatchOptions::builder().at(at).build()
    }

    pub fn recurring(schedule: RecurringSchedule, first: FirstOccurrence) -> Self {
        DispatchOptions::builder().recurring((schedule, first)).build()
    }

    pub fn with_task_key(mut self, key: impl Into<String>) -> Self {
        self.task_key = Some(key.into());
        self
    }
}

/// Entry point for submitting and cancelling tasks (spec §4.9).
pub struct Dispatcher {
    storage: Arc<dyn TaskStorage>,
    queues: Arc<QueueRegistry>,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        queues: Arc<QueueRegistry>,
        scheduler: Arc<Scheduler>,
        executor: Arc<Executor>,
        registry: Arc<HandlerRegistry>,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Dispatcher {
            storage,
            queues,
            scheduler,
            executor,
            registry,
            config,
            shutdown,
        }
    }

    /// Persists `payload` (serialized via the configured format, here
    /// `serde_json`, per spec §1's "out of scope: payload serialization
    /// format" — an application could swap this for its own encoder by
    /// constructing [`crate::model::PersistedTask`] directly and calling
    /// [`Self::dispatch_task`]) and routes it per `options` (spec §4.9).
    pub async fn dispatch<T: Serialize>(
        &self,
        payload: &T,
        task_type: &str,
        handler_type: &str,
        options: DispatchOptions,
    ) -> Result<TaskId> {
        let body = serde_json::to_string(payload)
            .map_err(|e| EverTaskError::Storage(anyhow::anyhow!("failed to serialize payload: {e}")))?;

        let scheduled = self.compute_first_due(&options);
        let audit_level = options.audit_level.unwrap_or(self.config.default_audit_level);
        // Precedence: an explicit per-dispatch override, then the handler's
        // own queue_name() (spec §6.1), then the recurring/one-shot default.
        let handler_queue_name = self.registry.resolve(handler_type).and_then(|h| h.queue_name());
        let queue_name = options
            .queue_name
            .clone()
            .or(handler_queue_name)
            .unwrap_or_else(|| default_queue_for(options.recurring.is_some()));

        if let Some(key) = &options.task_key {
            if key.len() > 200 {
                return Err(EverTaskError::InvalidTaskKey(format!(
                    "task_key exceeds 200 characters ({} given)",
                    key.len()
                )));
            }
        }

        let mut task = PersistedTask::builder()
            .task_type(task_type)
            .handler_type(handler_type)
            .payload(body)
            .queue_name(queue_name)
            .audit_level(audit_level)
            .status(TaskStatus::WaitingQueue)
            .build();
        task.scheduled_execution_utc = scheduled;
        task.recurring_info = options.recurring.as_ref().map(|(schedule, _)| schedule.clone());
        task.max_runs = options.max_runs;
        task.run_until_utc = options.run_until_utc;
        task.task_key = options.task_key.clone();

        match &options.task_key {
            Some(key) if !key.is_empty() => self.dispatch_keyed(task, key).await,
            _ => self.dispatch_task(task).await,
        }
    }

    /// First-occurrence computation (spec §4.9 step 1).
    fn compute_first_due(&self, options: &DispatchOptions) -> Option<DateTime<Utc>> {
        if let Some((schedule, first)) = &options.recurring {
            let now = Utc::now();
            return Some(match first {
                FirstOccurrence::RunNow => now,
                FirstOccurrence::RunDelayed(delay) => {
                    now + chrono::Duration::from_std(*delay).unwrap_or_default()
                }
                FirstOccurrence::RunAt(at) => *at,
                FirstOccurrence::ScheduleNext => schedule.next(now).unwrap_or(now),
            });
        }
        if let Some(at) = options.at {
            return Some(at);
        }
        if let Some(delay) = options.delay {
            return Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        }
        None
    }

    /// Idempotent keyed (re-)registration (spec §4.9.1).
    async fn dispatch_keyed(&self, mut task: PersistedTask, key: &str) -> Result<TaskId> {
        let existing = self
            .storage
            .get_by_task_key(key)
            .await
            .map_err(EverTaskError::Storage)?;

        let Some(existing) = existing else {
            return self.dispatch_task(task).await;
        };

        match existing.status {
            TaskStatus::InProgress => Ok(existing.id),
            TaskStatus::WaitingQueue | TaskStatus::Queued => {
                // Update schedule/payload/recurring descriptor in place,
                // keeping the same id (S6, property 3). If `existing` is
                // already `Queued`, `scheduler.cancel` can't retract a handle
                // that's already past the scheduler and sitting in the bounded
                // queue's channel, so `persist_and_route` below may enqueue a
                // second handle for the same id. `Executor::execute` claims
                // `in_flight` atomically per task_id, so only one of the two
                // handles actually runs the handler.
                self.scheduler.cancel(existing.id);
                task.id = existing.id;
                task.created_at_utc = existing.created_at_utc;
                self.persist_and_route(task).await
            }
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::ServiceStopped => {
                self.storage.delete(existing.id).await.map_err(EverTaskError::Storage)?;
                self.dispatch_task(task).await
            }
        }
    }

    /// Persists a brand-new task row and routes it (spec §4.9 steps 3-4).
    pub async fn dispatch_task(&self, task: PersistedTask) -> Result<TaskId> {
        self.persist_and_route(task).await
    }

    async fn persist_and_route(&self, task: PersistedTask) -> Result<TaskId> {
        let audit_level = task.audit_level;
        let scheduled = task.scheduled_execution_utc;
        let queue_name = task.queue_name.clone();
        let id = task.id;

        match self.storage.persist(task).await {
            Ok(id) => id,
            Err(err) => {
                if self.config.throw_if_unable_to_persist {
                    return Err(EverTaskError::Storage(err));
                }
                warn!(task.id = %id, error = %err, "failed to persist task, continuing in-memory only");
                id
            }
        };

        match scheduled {
            None => {
                if let Err(err) = self
                    .queues
                    .enqueue(
                        &queue_name,
                        ScheduledHandle {
                            task_id: id,
                            due: Utc::now(),
                            queue_name: queue_name.clone(),
                            audit_level,
                        },
                        &self.shutdown,
                    )
                    .await
                {
                    return Err(err);
                }
                if let Err(err) = self.storage.set_status(id, TaskStatus::Queued, None, audit_level).await {
                    warn!(task.id = %id, error = %err, "failed to persist Queued status after immediate enqueue");
                }
            }
            Some(due) => {
                self.scheduler.submit(ScheduledHandle {
                    task_id: id,
                    due,
                    queue_name,
                    audit_level,
                });
            }
        }

        info!(task.id = %id, "task dispatched");
        Ok(id)
    }

    /// Cancels a task (spec §4.9, §5 cancellation semantics).
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let task = self.storage.get(id).await.map_err(EverTaskError::Storage)?;
        let Some(task) = task else {
            return Err(EverTaskError::NotFound(id));
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        match task.status {
            TaskStatus::WaitingQueue | TaskStatus::Queued => {
                self.scheduler.cancel(id);
                self.storage.cancel(id).await.map_err(EverTaskError::Storage)?;
            }
            TaskStatus::InProgress => {
                // Signal the running handler; final status is decided by
                // the executor once the handler actually stops (spec §5).
                self.executor.cancel_in_flight(id);
            }
            _ => {}
        }
        Ok(())
    }
}

fn default_queue_for(is_recurring: bool) -> String {
    if is_recurring {
        "recurring".to_string()
    } else {
        "default".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::queue::{BoundedQueue, FullBehavior};
    use crate::storage::memory::InMemoryStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Serialize, serde::Deserialize)]
    struct Payload {
        n: u32,
    }

    struct Noop;
    #[async_trait]
    impl crate::handler::TaskHandler<Payload> for Noop {
        async fn handle(&self, _task: Payload, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn build() -> (Arc<InMemoryStorage>, Dispatcher) {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register::<_, Payload>("noop", Noop);

        let mut backing = HashMap::new();
        backing.insert("default".to_string(), Arc::new(BoundedQueue::new("default", 8, FullBehavior::Wait)));
        backing.insert("recurring".to_string(), Arc::new(BoundedQueue::new("recurring", 8, FullBehavior::Wait)));
        let queues = Arc::new(QueueRegistry::new(backing));

        let scheduler = Arc::new(Scheduler::new(1));
        let config = Arc::new(EngineConfig::default());
        let executor = Arc::new(Executor::new(
            storage.clone() as Arc<dyn TaskStorage>,
            registry.clone(),
            scheduler.clone(),
            config.clone(),
        ));
        let dispatcher = Dispatcher::new(
            storage.clone() as Arc<dyn TaskStorage>,
            queues,
            scheduler,
            executor,
            registry,
            config,
            CancellationToken::new(),
        );
        (storage, dispatcher)
    }

    #[tokio::test]
    async fn immediate_dispatch_routes_straight_to_queue() {
        let (storage, dispatcher) = build();
        let id = dispatcher
            .dispatch(&Payload { n: 1 }, "payload", "noop", DispatchOptions::immediate())
            .await
            .unwrap();
        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.queue_name, "default");
    }

    #[tokio::test]
    async fn delayed_dispatch_goes_to_scheduler_not_queue() {
        let (storage, dispatcher) = build();
        let id = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "noop",
                DispatchOptions::delayed(StdDuration::from_secs(60)),
            )
            .await
            .unwrap();
        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::WaitingQueue);
        assert!(task.scheduled_execution_utc.is_some());
    }

    struct PinnedQueueHandler;
    #[async_trait]
    impl crate::handler::TaskHandler<Payload> for PinnedQueueHandler {
        async fn handle(&self, _task: Payload, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }

        fn queue_name(&self) -> Option<&str> {
            Some("priority")
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_handler_s_queue_name_override() {
        let (storage, dispatcher) = build();
        dispatcher.registry.register::<_, Payload>("pinned", PinnedQueueHandler);
        let id = dispatcher
            .dispatch(&Payload { n: 1 }, "payload", "pinned", DispatchOptions::immediate())
            .await
            .unwrap();
        assert_eq!(storage.get(id).await.unwrap().unwrap().queue_name, "priority");
    }

    #[tokio::test]
    async fn explicit_queue_name_option_still_wins_over_handler_override() {
        let (storage, dispatcher) = build();
        dispatcher.registry.register::<_, Payload>("pinned2", PinnedQueueHandler);
        let id = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "pinned2",
                DispatchOptions::builder().queue_name("default").build(),
            )
            .await
            .unwrap();
        assert_eq!(storage.get(id).await.unwrap().unwrap().queue_name, "default");
    }

    #[tokio::test]
    async fn recurring_dispatch_defaults_to_recurring_queue() {
        let (storage, dispatcher) = build();
        let schedule = RecurringSchedule::cron("0 9 * * *").unwrap();
        let id = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "noop",
                DispatchOptions::recurring(schedule, FirstOccurrence::ScheduleNext),
            )
            .await
            .unwrap();
        assert_eq!(storage.get(id).await.unwrap().unwrap().queue_name, "recurring");
    }

    #[tokio::test]
    async fn s6_keyed_redispatch_while_queued_keeps_same_id() {
        let (storage, dispatcher) = build();
        let schedule_9am = RecurringSchedule::cron("0 9 * * *").unwrap();
        let id_a = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "noop",
                DispatchOptions::recurring(schedule_9am, FirstOccurrence::ScheduleNext).with_task_key("daily"),
            )
            .await
            .unwrap();

        let schedule_10am = RecurringSchedule::cron("0 10 * * *").unwrap();
        let id_b = dispatcher
            .dispatch(
                &Payload { n: 2 },
                "payload",
                "noop",
                DispatchOptions::recurring(schedule_10am, FirstOccurrence::ScheduleNext).with_task_key("daily"),
            )
            .await
            .unwrap();

        assert_eq!(id_a, id_b);
        let task = storage.get(id_b).await.unwrap().unwrap();
        assert_eq!(task.payload, r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn keyed_redispatch_after_completion_creates_new_row() {
        let (storage, dispatcher) = build();
        let id_a = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "noop",
                DispatchOptions::immediate().with_task_key("job"),
            )
            .await
            .unwrap();
        storage.set_status(id_a, TaskStatus::Completed, None, AuditLevel::Full).await.unwrap();

        let id_b = dispatcher
            .dispatch(
                &Payload { n: 2 },
                "payload",
                "noop",
                DispatchOptions::immediate().with_task_key("job"),
            )
            .await
            .unwrap();
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn task_key_over_200_chars_is_rejected() {
        let (_, dispatcher) = build();
        let key = "x".repeat(201);
        let err = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "noop",
                DispatchOptions::immediate().with_task_key(key),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EverTaskError::InvalidTaskKey(_)));
    }

    #[tokio::test]
    async fn cancel_before_in_progress_transitions_to_cancelled() {
        let (storage, dispatcher) = build();
        let id = dispatcher
            .dispatch(
                &Payload { n: 1 },
                "payload",
                "noop",
                DispatchOptions::delayed(StdDuration::from_secs(3600)),
            )
            .await
            .unwrap();
        dispatcher.cancel(id).await.unwrap();
        assert_eq!(storage.get(id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_on_unknown_id_is_not_found() {
        let (_, dispatcher) = build();
        let err = dispatcher.cancel(TaskId::now_v7()).await.unwrap_err();
        assert!(matches!(err, EverTaskError::NotFound(_)));
    }
}

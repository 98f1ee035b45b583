//! Public engine entry point: wires storage, queues, scheduler, executor,
//! worker pool, dispatcher, and recovery into one running instance.
//!
//! Grounded on the teacher's `ServiceHost`/service-wiring pattern
//! (`kernel/service_host.rs`, referenced from `worker.rs`'s doc example):
//! a builder collects dependencies and handler registrations, `build()`
//! spawns the background tasks, and a `shutdown` method drives the
//! graceful-stop sequence spec §4.7 describes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::Result;
use crate::executor::Executor;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::model::TaskId;
use crate::queue::{BoundedQueue, QueueRegistry};
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::scheduler::Scheduler;
use crate::storage::TaskStorage;
use crate::worker_pool::WorkerPool;

/// Collects handler registrations and configuration before the engine's
/// background tasks are spawned.
pub struct EngineBuilder {
    storage: Arc<dyn TaskStorage>,
    config: EngineConfig,
    registry: HandlerRegistry,
}

impl EngineBuilder {
    pub fn new(storage: Arc<dyn TaskStorage>, config: EngineConfig) -> Self {
        EngineBuilder {
            storage,
            config,
            registry: HandlerRegistry::new(),
        }
    }

    /// Registers a handler under `handler_type` (spec §6.1, §3.1).
    pub fn register_handler<H, T>(self, handler_type: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler<T> + Send + Sync + 'static,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.registry.register(handler_type, handler);
        self
    }

    /// Spawns the scheduler shards and worker pool, runs recovery
    /// (spec §4.10: "runs once at engine startup before accepting
    /// dispatches"), and returns a ready-to-use [`EverTaskEngine`].
    pub async fn build(self) -> anyhow::Result<EverTaskEngine> {
        let config = Arc::new(self.config);
        let registry = Arc::new(self.registry);
        let shutdown = CancellationToken::new();

        let mut backing = HashMap::new();
        let mut parallelism = HashMap::new();
        for name in config.all_queue_names() {
            backing.insert(
                name.clone(),
                Arc::new(BoundedQueue::new(
                    name.clone(),
                    config.capacity_for(&name),
                    config.full_behavior_for(&name),
                )),
            );
            parallelism.insert(name.clone(), config.parallelism_for(&name));
        }
        let queues = Arc::new(QueueRegistry::new(backing));

        let scheduler = Arc::new(Scheduler::new(config.shard_count));
        let executor = Arc::new(Executor::new(
            self.storage.clone(),
            registry.clone(),
            scheduler.clone(),
            config.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            self.storage.clone(),
            queues.clone(),
            scheduler.clone(),
            executor.clone(),
            registry.clone(),
            config.clone(),
            shutdown.clone(),
        ));

        let scheduler_handles = scheduler.spawn(queues.clone(), self.storage.clone(), shutdown.clone());
        let worker_pool = WorkerPool::spawn(queues.clone(), parallelism, executor.clone(), shutdown.clone());

        let recovery = RecoveryService::new(self.storage.clone(), queues.clone(), scheduler.clone());
        let recovery_report = recovery.run().await?;
        info!(
            requeued = recovery_report.requeued_to_worker_queue,
            resubmitted = recovery_report.resubmitted_to_scheduler,
            "engine started"
        );

        Ok(EverTaskEngine {
            storage: self.storage,
            queues,
            scheduler,
            executor,
            dispatcher,
            worker_pool: Some(worker_pool),
            scheduler_handles,
            shutdown,
            recovery_report,
        })
    }
}

/// A running EverTask engine instance. Dropping it leaves background
/// tasks running; call [`EverTaskEngine::shutdown`] for a graceful stop.
pub struct EverTaskEngine {
    storage: Arc<dyn TaskStorage>,
    queues: Arc<QueueRegistry>,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    dispatcher: Arc<Dispatcher>,
    worker_pool: Option<WorkerPool>,
    scheduler_handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown: CancellationToken,
    recovery_report: RecoveryReport,
}

impl EverTaskEngine {
    pub fn builder(storage: Arc<dyn TaskStorage>, config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(storage, config)
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery_report
    }

    /// Dispatches a task request (spec §4.9).
    pub async fn dispatch<T: Serialize>(
        &self,
        payload: &T,
        task_type: &str,
        handler_type: &str,
        options: DispatchOptions,
    ) -> Result<TaskId> {
        self.dispatcher.dispatch(payload, task_type, handler_type, options).await
    }

    /// Cancels a task (spec §4.9, §5).
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        self.dispatcher.cancel(id).await
    }

    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    pub fn scheduler_pending_count(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Graceful shutdown (spec §4.7): stop accepting new reads, signal
    /// cancellation to every in-flight execution, wait up to `grace` for
    /// them to drain, then stop waiting regardless — the executor has
    /// already persisted `ServiceStopped` for anything still running by
    /// then, and recovery re-queues it on the next startup.
    pub async fn shutdown(mut self, grace: Duration) {
        self.shutdown.cancel();

        let pool_join = async {
            if let Some(pool) = self.worker_pool.take() {
                pool.join().await;
            }
        };
        if tokio::time::timeout(grace, pool_join).await.is_err() {
            tracing::warn!("worker pool did not drain within the shutdown grace period");
        }

        for handle in self.scheduler_handles.drain(..) {
            handle.abort();
        }
    }
}

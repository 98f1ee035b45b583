//! Multi-queue worker pool: bounded parallelism over each named queue's
//! bounded channel (spec §4.7).
//!
//! Shaped like the teacher's `JobWorker::run` loop (`kernel/jobs/worker.rs`):
//! suspend on an empty source rather than busy-poll, spawn one execution
//! per item, track outstanding work for a graceful-shutdown drain. The
//! teacher polls a single shared `JobStore`; here there is one such loop
//! per named queue, each gated by its own semaphore sized to that queue's
//! `max_parallelism` (spec §4.7 "bounded parallelism").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::executor::Executor;
use crate::queue::QueueRegistry;

/// Owns one background reader task per named queue.
pub struct WorkerPool {
    join_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a reader for every queue in `queues`, gated by
    /// `parallelism[name]` concurrent executions (spec §4.7).
    pub fn spawn(
        queues: Arc<QueueRegistry>,
        parallelism: HashMap<String, usize>,
        executor: Arc<Executor>,
        shutdown: CancellationToken,
    ) -> Self {
        let join_handles = queues
            .names()
            .map(|name| {
                let name = name.to_string();
                let queue = queues.get(&name).expect("queue just listed by name() must exist");
                let permits = parallelism.get(&name).copied().unwrap_or(1).max(1);
                let semaphore = Arc::new(Semaphore::new(permits));
                let executor = executor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move { run_queue(name.clone(), queue, semaphore, executor, shutdown).await }
                        .instrument(info_span!("worker_pool", queue = %name)),
                )
            })
            .collect();
        WorkerPool { join_handles }
    }

    /// Awaits every queue reader, e.g. after a shutdown signal has been
    /// raised. Readers exit once their channel closes or shutdown fires.
    pub async fn join(self) {
        futures::future::join_all(self.join_handles).await;
    }
}

async fn run_queue(
    queue_name: String,
    queue: Arc<crate::queue::BoundedQueue>,
    semaphore: Arc<Semaphore>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
) {
    let mut receiver = queue.take_receiver().await;
    loop {
        let handle = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            received = receiver.recv() => received,
        };
        let Some(handle) = handle else {
            break;
        };

        // Suspends here under full parallelism rather than spawning
        // unboundedly (spec §4.7 "enforces per-queue parallelism cap").
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let executor = executor.clone();
        let shutdown_child = shutdown.clone();
        tokio::spawn(async move {
            executor.execute(handle, shutdown_child).await;
            drop(permit);
        });
    }
    debug!(queue = %queue_name, "worker pool reader shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handler::HandlerRegistry;
    use crate::model::{AuditLevel, PersistedTask, TaskStatus};
    use crate::queue::{BoundedQueue, FullBehavior, ScheduledHandle};
    use crate::scheduler::Scheduler;
    use crate::storage::memory::InMemoryStorage;
    use crate::storage::TaskStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Ping;

    struct CountingHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl crate::handler::TaskHandler<Ping> for CountingHandler {
        async fn handle(&self, _task: Ping, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_executes_a_dequeued_handle() {
        let storage: Arc<dyn TaskStorage> = Arc::new(InMemoryStorage::new());
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(AtomicU32::new(0));
        registry.register::<_, Ping>("ping", CountingHandler { calls: calls.clone() });

        let task = PersistedTask::builder()
            .task_type("ping")
            .handler_type("ping")
            .payload("null")
            .status(TaskStatus::Queued)
            .build();
        let id = storage.persist(task).await.unwrap();

        let mut queues_map = HashMap::new();
        queues_map.insert(
            "default".to_string(),
            Arc::new(BoundedQueue::new("default", 8, FullBehavior::Wait)),
        );
        let queues = Arc::new(QueueRegistry::new(queues_map));

        let executor = Arc::new(Executor::new(
            storage.clone(),
            registry,
            Arc::new(Scheduler::new(1)),
            Arc::new(EngineConfig::default()),
        ));

        let shutdown = CancellationToken::new();
        let mut parallelism = HashMap::new();
        parallelism.insert("default".to_string(), 2);
        let pool = WorkerPool::spawn(queues.clone(), parallelism, executor, shutdown.clone());

        queues
            .enqueue(
                "default",
                ScheduledHandle {
                    task_id: id,
                    due: chrono::Utc::now(),
                    queue_name: "default".into(),
                    audit_level: AuditLevel::Full,
                },
                &shutdown,
            )
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("handler should have run");

        shutdown.cancel();
        pool.join().await;

        let task = storage.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

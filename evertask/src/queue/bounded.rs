//! Per-named-queue bounded channel with configurable full-queue behavior
//! (spec §4.6).
//!
//! `tokio::sync::mpsc` already gives a bounded multi-producer,
//! single-consumer channel with both an awaiting `send` and a
//! non-blocking `try_send`, which is exactly `Wait` and
//! `ThrowOnFull`/`FallbackToDefault` respectively — no custom channel
//! implementation needed, unlike the priority queue's heap.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::priority::ScheduledHandle;
use crate::error::EverTaskError;

/// Behavior when a named queue is at capacity (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullBehavior {
    /// Block (honoring cancellation) until space frees up.
    Wait,
    /// Route to the `default` queue instead, non-blocking. If `default`
    /// is also full, `default`'s own configured behavior applies (with
    /// `FallbackToDefault` on `default` itself downgraded to
    /// `ThrowOnFull` to avoid a self-referential loop).
    FallbackToDefault,
    /// Reject immediately with [`EverTaskError::QueueFull`].
    ThrowOnFull,
}

pub struct BoundedQueue {
    name: String,
    full_behavior: FullBehavior,
    sender: mpsc::Sender<ScheduledHandle>,
    receiver: AsyncMutex<Option<mpsc::Receiver<ScheduledHandle>>>,
}

impl BoundedQueue {
    pub fn new(name: impl Into<String>, capacity: usize, full_behavior: FullBehavior) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        BoundedQueue {
            name: name.into(),
            full_behavior,
            sender,
            receiver: AsyncMutex::new(Some(receiver)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes ownership of the receiving half. Called exactly once, by the
    /// worker pool task that owns this queue's reads (spec §4.7: "a
    /// background task repeatedly reads handles").
    pub async fn take_receiver(&self) -> mpsc::Receiver<ScheduledHandle> {
        self.receiver
            .lock()
            .await
            .take()
            .expect("BoundedQueue receiver already taken")
    }
}

/// Owns every named queue declared in the engine configuration plus the
/// built-in `default` and `recurring` queues (spec §4.6).
pub struct QueueRegistry {
    queues: HashMap<String, Arc<BoundedQueue>>,
}

impl QueueRegistry {
    pub fn new(queues: HashMap<String, Arc<BoundedQueue>>) -> Self {
        QueueRegistry { queues }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoundedQueue>> {
        self.queues.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Routes `handle` to `queue_name` (or `default` if unknown),
    /// applying that queue's full-behavior policy.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        handle: ScheduledHandle,
        cancel: &CancellationToken,
    ) -> Result<(), EverTaskError> {
        let queue = self
            .queues
            .get(queue_name)
            .or_else(|| self.queues.get("default"))
            .expect("a 'default' queue must always be registered")
            .clone();

        match queue.full_behavior {
            FullBehavior::Wait => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(EverTaskError::Cancelled),
                    res = queue.sender.send(handle) => res.map_err(|_| EverTaskError::QueueFull(queue.name.clone())),
                }
            }
            FullBehavior::ThrowOnFull => queue
                .sender
                .try_send(handle)
                .map_err(|_| EverTaskError::QueueFull(queue.name.clone())),
            FullBehavior::FallbackToDefault => match queue.sender.try_send(handle) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(EverTaskError::QueueFull(queue.name.clone()))
                }
                Err(mpsc::error::TrySendError::Full(handle)) => {
                    if queue.name == "default" {
                        return Err(EverTaskError::QueueFull(queue.name.clone()));
                    }
                    let default_queue = self
                        .queues
                        .get("default")
                        .expect("a 'default' queue must always be registered");
                    match default_queue.full_behavior {
                        FullBehavior::Wait => {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => Err(EverTaskError::Cancelled),
                                res = default_queue.sender.send(handle) => {
                                    res.map_err(|_| EverTaskError::QueueFull("default".into()))
                                }
                            }
                        }
                        _ => default_queue
                            .sender
                            .try_send(handle)
                            .map_err(|_| EverTaskError::QueueFull("default".into())),
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn handle() -> ScheduledHandle {
        ScheduledHandle {
            task_id: Uuid::now_v7(),
            due: Utc::now(),
            queue_name: "default".into(),
            audit_level: crate::model::AuditLevel::Full,
        }
    }

    fn registry(email_behavior: FullBehavior) -> QueueRegistry {
        let mut queues = HashMap::new();
        queues.insert(
            "default".to_string(),
            Arc::new(BoundedQueue::new("default", 8, FullBehavior::Wait)),
        );
        queues.insert(
            "email".to_string(),
            Arc::new(BoundedQueue::new("email", 1, email_behavior)),
        );
        QueueRegistry::new(queues)
    }

    #[tokio::test]
    async fn throw_on_full_rejects_immediately() {
        let reg = registry(FullBehavior::ThrowOnFull);
        let cancel = CancellationToken::new();
        reg.enqueue("email", handle(), &cancel).await.unwrap();
        let err = reg.enqueue("email", handle(), &cancel).await.unwrap_err();
        assert!(matches!(err, EverTaskError::QueueFull(name) if name == "email"));
    }

    #[tokio::test]
    async fn s5_fallback_to_default_routes_overflow() {
        // spec.md S5: capacity-1 "email" queue with FallbackToDefault;
        // task A accepted, task B falls through to "default".
        let reg = registry(FullBehavior::FallbackToDefault);
        let cancel = CancellationToken::new();
        let a = handle();
        let b = handle();
        reg.enqueue("email", a.clone(), &cancel).await.unwrap();
        reg.enqueue("email", b.clone(), &cancel).await.unwrap();

        let mut email_rx = reg.get("email").unwrap().take_receiver().await;
        let mut default_rx = reg.get("default").unwrap().take_receiver().await;

        assert_eq!(email_rx.try_recv().unwrap().task_id, a.task_id);
        assert!(email_rx.try_recv().is_err());
        assert_eq!(default_rx.try_recv().unwrap().task_id, b.task_id);
    }

    #[tokio::test]
    async fn wait_blocks_until_capacity_frees() {
        let reg = registry(FullBehavior::Wait);
        let cancel = CancellationToken::new();
        reg.enqueue("default", handle(), &cancel).await.unwrap();
        // capacity 8 on default, so this does not block.
        reg.enqueue("default", handle(), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_aborts_a_waiting_enqueue() {
        let mut queues = HashMap::new();
        queues.insert(
            "default".to_string(),
            Arc::new(BoundedQueue::new("default", 1, FullBehavior::Wait)),
        );
        let reg = QueueRegistry::new(queues);
        let cancel = CancellationToken::new();
        reg.enqueue("default", handle(), &cancel).await.unwrap();
        cancel.cancel();
        let err = reg.enqueue("default", handle(), &cancel).await.unwrap_err();
        assert!(matches!(err, EverTaskError::Cancelled));
    }
}

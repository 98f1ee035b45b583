//! Thread-safe min-heap of scheduled handles, ordered by due time with
//! insertion-order tie-break (spec §3.3, §4.4).
//!
//! No direct teacher analog exists (the teacher computes `next_run_at`
//! and lets a SQL `ORDER BY` do the ordering); this is modeled on the
//! generic "lock-guarded heap + `Notify` wake signal" shape used by the
//! `eden-tasks` reference crate's task manager for its own pending-task
//! bookkeeping.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::model::{AuditLevel, TaskId};

/// A lightweight in-memory reference to a task awaiting release, carrying
/// only what the scheduler and worker queues need (spec GLOSSARY: Handle).
///
/// `audit_level` rides along so the scheduler's release path can flip
/// `WaitingQueue -> Queued` on successful bounded-queue enqueue (spec
/// §4.9 step 3) without an extra storage round trip to re-fetch the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledHandle {
    pub task_id: TaskId,
    pub due: DateTime<Utc>,
    pub queue_name: String,
    pub audit_level: AuditLevel,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry {
    due: DateTime<Utc>,
    sequence: u64,
    handle: ScheduledHandle,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest (due, sequence)
        // sorts to the top.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

/// A single scheduler shard's priority queue. Mutations take an internal
/// lock and an `enqueue` releases [`PriorityQueue::notified`]'s waiter so
/// the owning event loop re-evaluates its wait (spec §4.4).
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, handle: ScheduledHandle) {
        let mut guard = self.inner.lock().unwrap();
        let sequence = guard.next_sequence;
        guard.next_sequence += 1;
        guard.heap.push(Entry {
            due: handle.due,
            sequence,
            handle,
        });
        drop(guard);
        self.notify.notify_one();
    }

    /// Due time of the earliest entry, without removing it.
    pub fn try_peek(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().heap.peek().map(|e| e.due)
    }

    /// Removes and returns every entry with `due <= now`.
    pub fn dequeue_ready_before(&self, now: DateTime<Utc>) -> Vec<ScheduledHandle> {
        let mut guard = self.inner.lock().unwrap();
        let mut ready = Vec::new();
        while let Some(top) = guard.heap.peek() {
            if top.due > now {
                break;
            }
            ready.push(guard.heap.pop().unwrap().handle);
        }
        ready
    }

    /// Removes every pending handle for `task_id`, e.g. on user
    /// cancellation before release. Returns whether anything was removed.
    pub fn remove(&self, task_id: TaskId) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.heap.len();
        let remaining: Vec<Entry> = guard.heap.drain().filter(|e| e.handle.task_id != task_id).collect();
        let removed = remaining.len() != before;
        guard.heap = remaining.into_iter().collect();
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Awaits the next `enqueue` wake-up. The scheduler loop races this
    /// against a timeout derived from [`Self::try_peek`].
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn handle(due: DateTime<Utc>) -> ScheduledHandle {
        ScheduledHandle {
            task_id: Uuid::now_v7(),
            due,
            queue_name: "default".into(),
            audit_level: AuditLevel::Full,
        }
    }

    #[test]
    fn dequeue_ready_before_drains_only_due_entries() {
        let q = PriorityQueue::new();
        let now = Utc::now();
        q.enqueue(handle(now - Duration::seconds(5)));
        q.enqueue(handle(now + Duration::hours(1)));
        let ready = q.dequeue_ready_before(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn property_5_priority_ordering() {
        // spec.md property 5: due_A < due_B releases A strictly before B.
        let q = PriorityQueue::new();
        let now = Utc::now();
        let a = handle(now);
        let b = handle(now + Duration::seconds(1));
        q.enqueue(b.clone());
        q.enqueue(a.clone());
        let ready = q.dequeue_ready_before(now + Duration::seconds(2));
        assert_eq!(ready[0].task_id, a.task_id);
        assert_eq!(ready[1].task_id, b.task_id);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let q = PriorityQueue::new();
        let now = Utc::now();
        let first = handle(now);
        let second = handle(now);
        q.enqueue(first.clone());
        q.enqueue(second.clone());
        let ready = q.dequeue_ready_before(now);
        assert_eq!(ready[0].task_id, first.task_id);
        assert_eq!(ready[1].task_id, second.task_id);
    }

    #[test]
    fn remove_drops_pending_handle() {
        let q = PriorityQueue::new();
        let h = handle(Utc::now() + Duration::hours(1));
        let id = h.task_id;
        q.enqueue(h);
        assert!(q.remove(id));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn enqueue_wakes_a_waiter() {
        let q = std::sync::Arc::new(PriorityQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.notified().await;
        });
        tokio::task::yield_now().await;
        q.enqueue(handle(Utc::now()));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should have woken")
            .unwrap();
    }
}

//! In-memory queueing: the scheduler's priority heap and the worker
//! pool's bounded per-queue channels (spec §4.4, §4.6).

pub mod bounded;
pub mod priority;

pub use bounded::{BoundedQueue, FullBehavior, QueueRegistry};
pub use priority::{PriorityQueue, ScheduledHandle};

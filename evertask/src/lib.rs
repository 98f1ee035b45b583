//! EverTask: a persistent background task execution engine.
//!
//! A task is dispatched once (immediate, delayed, at a fixed time, or on
//! a recurring schedule), persisted durably, and carried through a
//! time-ordered scheduler and a bounded, per-queue worker pool to an
//! executor that enforces timeouts and retry policy and drives the task
//! through its lifecycle. A [`recovery::RecoveryService`] re-establishes
//! ownership of anything left pending by a prior process at startup.
//!
//! ```ignore
//! use std::sync::Arc;
//! use evertask::{DispatchOptions, EngineConfig, EverTaskEngine, InMemoryStorage};
//!
//! let storage: Arc<dyn evertask::TaskStorage> = Arc::new(InMemoryStorage::new());
//! let engine = EverTaskEngine::builder(storage, EngineConfig::default())
//!     .register_handler("send_email", MyEmailHandler::new())
//!     .build()
//!     .await?;
//!
//! engine.dispatch(&SendEmail { to: "ada@example.com".into() },
//!     "send_email", "send_email", DispatchOptions::immediate()).await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handler;
pub mod model;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod worker_pool;

pub use config::{EngineConfig, QueueDefinition};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use engine::{EngineBuilder, EverTaskEngine};
pub use error::{EverTaskError, Result};
pub use handler::{HandlerRegistry, TaskHandler};
pub use model::{AuditLevel, PersistedTask, TaskId, TaskStatus};
pub use queue::FullBehavior;
pub use recovery::{RecoveryReport, RecoveryService};
pub use retry::RetryPolicy;
pub use schedule::{FirstOccurrence, RecurringSchedule, ScheduleBuilder};
pub use storage::memory::InMemoryStorage;
pub use storage::TaskStorage;

#[cfg(feature = "postgres")]
pub use storage::sqlx_backend::PostgresStorage;

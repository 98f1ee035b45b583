//! Application-facing handler contract and the type-erased registry that
//! lets the executor dispatch a persisted payload to it (spec §6.1).
//!
//! Grounded on the teacher's `JobRegistry` (`kernel/jobs/registry.rs`):
//! the same "map a type-name string to a boxed closure that deserializes
//! JSON and calls into concrete domain code" shape, generalized from a
//! single `execute(Value, Deps) -> Result<()>` entry point into the full
//! lifecycle-hook surface spec.md §6.1 requires. Per §9's "reflection
//! caches become compile-time dispatch or explicit registry maps" note,
//! there is no runtime type reflection here: each concrete handler is
//! wrapped once, at registration time, by a generic function that knows
//! its own `T`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::model::TaskId;
use crate::retry::RetryPolicy;

/// A unit of work a handler knows how to execute (spec §6.1).
///
/// `T` is the task's payload type, deserialized from [`crate::model::PersistedTask::payload`].
/// Each execution gets its own `H` instance behind the `Arc` the caller
/// registered with — "constructed fresh per execution with its own
/// short-lived dependency bundle" (spec §9) is satisfied by registering
/// a handler that itself holds only shareable, cloneable dependencies
/// (connection pools, clients) and does per-call setup inside `handle`.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Executes the task. Cooperative cancellation: implementations
    /// should select on `cancel` at their own suspension points.
    async fn handle(&self, task: T, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn on_started(&self, _id: TaskId) {}
    async fn on_completed(&self, _id: TaskId) {}
    async fn on_error(&self, _id: TaskId, _error: Option<&anyhow::Error>, _message: Option<&str>) {}
    async fn on_retry(&self, _id: TaskId, _attempt: u32, _error: &anyhow::Error, _delay: Duration) {}

    /// Async disposal hook, called once after the task leaves `InProgress`
    /// regardless of outcome. Exceptions are logged, never propagated
    /// (spec §4.8 step 6).
    async fn dispose(&self) {}

    /// Overrides [`crate::config::EngineConfig::default_retry_policy`] for
    /// tasks of this handler type.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Overrides [`crate::config::EngineConfig::default_timeout`].
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Overrides the queue a task of this type routes to when the
    /// dispatcher doesn't pin one explicitly.
    fn queue_name(&self) -> Option<&str> {
        None
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased view of a registered [`TaskHandler`], keyed by
/// `handler_type` in the registry below. Mirrors the teacher's
/// `BoxedHandler` (`registry.rs`), extended with the hook surface.
trait ErasedHandler: Send + Sync {
    fn handle<'a>(&'a self, payload: &'a str, cancel: CancellationToken) -> BoxFuture<'a, anyhow::Result<()>>;
    fn on_started<'a>(&'a self, id: TaskId) -> BoxFuture<'a, ()>;
    fn on_completed<'a>(&'a self, id: TaskId) -> BoxFuture<'a, ()>;
    fn on_error<'a>(&'a self, id: TaskId, error: Option<&'a anyhow::Error>, message: Option<&'a str>) -> BoxFuture<'a, ()>;
    fn on_retry<'a>(&'a self, id: TaskId, attempt: u32, error: &'a anyhow::Error, delay: Duration) -> BoxFuture<'a, ()>;
    fn dispose<'a>(&'a self) -> BoxFuture<'a, ()>;
    fn retry_policy(&self) -> Option<RetryPolicy>;
    fn timeout(&self) -> Option<Duration>;
    fn queue_name(&self) -> Option<String>;
}

struct Wrapper<H, T> {
    handler: H,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<H, T> ErasedHandler for Wrapper<H, T>
where
    H: TaskHandler<T> + Send + Sync,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, payload: &'a str, cancel: CancellationToken) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let task: T = serde_json::from_str(payload)
                .map_err(|e| anyhow!("failed to deserialize task payload: {e}"))?;
            self.handler.handle(task, cancel).await
        })
    }

    fn on_started<'a>(&'a self, id: TaskId) -> BoxFuture<'a, ()> {
        Box::pin(self.handler.on_started(id))
    }

    fn on_completed<'a>(&'a self, id: TaskId) -> BoxFuture<'a, ()> {
        Box::pin(self.handler.on_completed(id))
    }

    fn on_error<'a>(&'a self, id: TaskId, error: Option<&'a anyhow::Error>, message: Option<&'a str>) -> BoxFuture<'a, ()> {
        Box::pin(self.handler.on_error(id, error, message))
    }

    fn on_retry<'a>(&'a self, id: TaskId, attempt: u32, error: &'a anyhow::Error, delay: Duration) -> BoxFuture<'a, ()> {
        Box::pin(self.handler.on_retry(id, attempt, error, delay))
    }

    fn dispose<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(self.handler.dispose())
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.handler.retry_policy()
    }

    fn timeout(&self) -> Option<Duration> {
        self.handler.timeout()
    }

    fn queue_name(&self) -> Option<String> {
        self.handler.queue_name().map(str::to_string)
    }
}

/// Everything the executor needs from a handler registration, resolved
/// once per execution so the executor never matches on `handler_type`
/// itself (spec §9: compile-time/registry dispatch, not reflection).
pub struct ResolvedHandler {
    inner: Arc<dyn ErasedHandler>,
}

impl ResolvedHandler {
    pub async fn handle(&self, payload: &str, cancel: CancellationToken) -> anyhow::Result<()> {
        self.inner.handle(payload, cancel).await
    }

    pub async fn on_started(&self, id: TaskId) {
        self.inner.on_started(id).await
    }

    pub async fn on_completed(&self, id: TaskId) {
        self.inner.on_completed(id).await
    }

    pub async fn on_error(&self, id: TaskId, error: Option<&anyhow::Error>, message: Option<&str>) {
        self.inner.on_error(id, error, message).await
    }

    pub async fn on_retry(&self, id: TaskId, attempt: u32, error: &anyhow::Error, delay: Duration) {
        self.inner.on_retry(id, attempt, error, delay).await
    }

    pub async fn dispose(&self) {
        self.inner.dispose().await
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.inner.retry_policy()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    pub fn queue_name(&self) -> Option<String> {
        self.inner.queue_name()
    }
}

/// Maps `handler_type` strings to registered handlers.
///
/// `DashMap` over the `Arc<RwLock<HashMap<_>>>` the queue/priority module
/// uses: registration happens once at startup and lookups are on the hot
/// execution path for every dequeued task, the same read-heavy profile
/// `ServerDeps`' other lookup tables use `dashmap` for in this codebase.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers a concrete handler under `handler_type` (spec §3.1's
    /// `PersistedTask::handler_type`).
    pub fn register<H, T>(&self, handler_type: impl Into<String>, handler: H)
    where
        H: TaskHandler<T> + Send + Sync + 'static,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let wrapper: Arc<dyn ErasedHandler> = Arc::new(Wrapper {
            handler,
            _marker: std::marker::PhantomData,
        });
        self.handlers.insert(handler_type.into(), wrapper);
    }

    pub fn resolve(&self, handler_type: &str) -> Option<ResolvedHandler> {
        self.handlers
            .get(handler_type)
            .map(|entry| ResolvedHandler { inner: entry.clone() })
    }

    pub fn is_registered(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

//! Test utilities for applications embedding EverTask.
//!
//! [`RecordingHandler`] mirrors the teacher's `MockJobHandler`
//! (`kernel/jobs/manager.rs`): a generic handler that records every
//! invocation for later assertion and can be told to fail on demand,
//! rather than a real domain handler with side effects.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::handler::TaskHandler;
use crate::model::TaskId;
use crate::retry::RetryPolicy;

/// A handler that records invocations and, optionally, fails or sleeps
/// on command — for exercising the dispatcher/scheduler/worker
/// pool/executor pipeline end to end without a real side-effecting
/// handler.
pub struct RecordingHandler<T> {
    invocations: RwLock<Vec<T>>,
    should_fail: RwLock<bool>,
    sleep_for: RwLock<Option<Duration>>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl<T> Default for RecordingHandler<T> {
    fn default() -> Self {
        RecordingHandler {
            invocations: RwLock::new(Vec::new()),
            should_fail: RwLock::new(false),
            sleep_for: RwLock::new(None),
            retry_policy: None,
            timeout: None,
        }
    }
}

impl<T: Clone> RecordingHandler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn set_should_fail(&self, should_fail: bool) {
        *self.should_fail.write().unwrap_or_else(|e| e.into_inner()) = should_fail;
    }

    pub fn set_sleep_for(&self, duration: Option<Duration>) {
        *self.sleep_for.write().unwrap_or_else(|e| e.into_inner()) = duration;
    }

    pub fn invocations(&self) -> Vec<T> {
        self.invocations.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl<T> TaskHandler<T> for RecordingHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, task: T, cancel: CancellationToken) -> anyhow::Result<()> {
        self.invocations.write().unwrap_or_else(|e| e.into_inner()).push(task);

        if let Some(duration) = *self.sleep_for.read().unwrap_or_else(|e| e.into_inner()) {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = cancel.cancelled() => return Err(crate::error::EverTaskError::Cancelled.into()),
            }
        }

        if *self.should_fail.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(anyhow::anyhow!("RecordingHandler configured to fail"));
        }
        Ok(())
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Tracks lifecycle-hook invocations separately, for tests asserting on
/// `on_started`/`on_completed`/`on_error`/`on_retry` ordering.
#[derive(Default)]
pub struct HookLog {
    events: RwLock<Vec<String>>,
}

impl HookLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.write().unwrap_or_else(|e| e.into_inner()).push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A handler wrapping a [`RecordingHandler`] with hook logging, for tests
/// that need both invocation recording and lifecycle-hook assertions.
pub struct HookedHandler<T> {
    pub inner: RecordingHandler<T>,
    pub hooks: HookLog,
}

impl<T: Clone> HookedHandler<T> {
    pub fn new() -> Self {
        HookedHandler {
            inner: RecordingHandler::new(),
            hooks: HookLog::new(),
        }
    }
}

impl<T: Clone> Default for HookedHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> TaskHandler<T> for HookedHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, task: T, cancel: CancellationToken) -> anyhow::Result<()> {
        self.inner.handle(task, cancel).await
    }

    async fn on_started(&self, _id: TaskId) {
        self.hooks.push("started");
    }

    async fn on_completed(&self, _id: TaskId) {
        self.hooks.push("completed");
    }

    async fn on_error(&self, _id: TaskId, _error: Option<&anyhow::Error>, _message: Option<&str>) {
        self.hooks.push("error");
    }

    async fn on_retry(&self, _id: TaskId, attempt: u32, _error: &anyhow::Error, _delay: Duration) {
        self.hooks.push(format!("retry:{attempt}"));
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.inner.retry_policy()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }
}

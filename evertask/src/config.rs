//! Engine-wide configuration surface (spec §6.3).
//!
//! A plain, programmatically-constructed struct with a `typed_builder`
//! builder, matching the teacher's `ScheduleOptions`/`JobWorkerConfig`
//! shape (`kernel/jobs/manager.rs`, `kernel/jobs/worker.rs`): no env/file
//! loading is specified, construction is purely in-process.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::model::AuditLevel;
use crate::queue::FullBehavior;
use crate::retry::RetryPolicy;

/// Per-named-queue overrides (spec §4.6, §6.3 `queue_definitions`).
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueueDefinition {
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub capacity: Option<usize>,
    #[builder(default, setter(strip_option))]
    pub max_parallelism: Option<usize>,
    #[builder(default, setter(strip_option))]
    pub full_behavior: Option<FullBehavior>,
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
    #[builder(default, setter(strip_option))]
    pub retry_policy: Option<RetryPolicy>,
}

impl QueueDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        QueueDefinition::builder().name(name).build()
    }
}

/// Engine-wide defaults and the declared queue set (spec §6.3).
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EngineConfig {
    #[builder(default = 100)]
    pub channel_capacity: usize,
    #[builder(default = 4)]
    pub max_parallelism: usize,
    #[builder(default = RetryPolicy::linear(3, Duration::from_secs(5)))]
    pub default_retry_policy: RetryPolicy,
    #[builder(default, setter(strip_option))]
    pub default_timeout: Option<Duration>,
    #[builder(default)]
    pub default_audit_level: AuditLevel,
    #[builder(default = false)]
    pub throw_if_unable_to_persist: bool,
    #[builder(default = 1)]
    pub shard_count: usize,
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,
    /// Cap on buffered [`crate::model::ExecutionLogEntry`] rows per run
    /// before they're flushed via `save_execution_logs` (spec §5: "capped
    /// (default 1000 entries, ~100 bytes each)").
    #[builder(default = 1000)]
    pub execution_log_cap: usize,
    #[builder(default)]
    pub queue_definitions: Vec<QueueDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::builder().build()
    }
}

impl EngineConfig {
    /// Capacity for `name`, falling back to [`Self::channel_capacity`].
    pub fn capacity_for(&self, name: &str) -> usize {
        self.queue_definitions
            .iter()
            .find(|q| q.name == name)
            .and_then(|q| q.capacity)
            .unwrap_or(self.channel_capacity)
    }

    pub fn parallelism_for(&self, name: &str) -> usize {
        self.queue_definitions
            .iter()
            .find(|q| q.name == name)
            .and_then(|q| q.max_parallelism)
            .unwrap_or(self.max_parallelism)
    }

    pub fn full_behavior_for(&self, name: &str) -> FullBehavior {
        self.queue_definitions
            .iter()
            .find(|q| q.name == name)
            .and_then(|q| q.full_behavior)
            .unwrap_or(FullBehavior::Wait)
    }

    pub fn timeout_for(&self, name: &str) -> Option<Duration> {
        self.queue_definitions
            .iter()
            .find(|q| q.name == name)
            .and_then(|q| q.timeout)
            .or(self.default_timeout)
    }

    pub fn retry_policy_for(&self, name: &str) -> RetryPolicy {
        self.queue_definitions
            .iter()
            .find(|q| q.name == name)
            .and_then(|q| q.retry_policy.clone())
            .unwrap_or_else(|| self.default_retry_policy.clone())
    }

    /// Every queue name the engine must provision at startup: `default`,
    /// `recurring` (spec §4.6's built-ins), and anything user-declared.
    pub fn all_queue_names(&self) -> Vec<String> {
        let mut names = vec!["default".to_string(), "recurring".to_string()];
        for def in &self.queue_definitions {
            if !names.contains(&def.name) {
                names.push(def.name.clone());
            }
        }
        names
    }
}

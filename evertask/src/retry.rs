//! Retry policy: delay plan, exception filtering, and the attempt loop
//! (spec §4.2).
//!
//! The teacher's `classify_error` (`kernel/jobs/runner.rs`) heuristically
//! string-matches error messages to decide retryability. spec.md's
//! whitelist/blacklist modes need to match on exception *type*, which in
//! Rust means compile-time-captured predicates rather than runtime
//! reflection (§9: "reflection-cached ... become explicit ... maps"):
//! [`RetryPolicy::retry_on`]/[`RetryPolicy::except`] close over a concrete
//! error type at the call site and test it with `anyhow::Error::is`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::EverTaskError;

/// A type-erased "is this error of type E" test, built by [`type_predicate`].
pub type TypePredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

pub fn type_predicate<E>() -> TypePredicate
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(|err: &anyhow::Error| err.is::<E>())
}

/// How delays between attempts are produced.
#[derive(Clone)]
pub enum DelayPlan {
    /// `count` retries (so `count + 1` total attempts), each waiting `delay`.
    FixedRepeat { count: u32, delay: Duration },
    /// An explicit sequence of delays; its length is the retry count.
    Explicit(Vec<Duration>),
}

impl DelayPlan {
    fn delays(&self) -> Vec<Duration> {
        match self {
            DelayPlan::FixedRepeat { count, delay } => vec![*delay; *count as usize],
            DelayPlan::Explicit(delays) => delays.clone(),
        }
    }
}

/// Mutually exclusive exception-filtering modes (spec §4.2).
#[derive(Clone)]
pub enum RetryFilter {
    Whitelist(Vec<TypePredicate>),
    Blacklist(Vec<TypePredicate>),
    Predicate(Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>),
    /// Retry everything except cancellation/timeout (which fail fast
    /// regardless of the configured filter, see [`is_fail_fast`]).
    Default,
}

/// A task's retry policy: delay plan + exception filter (spec §4.2).
#[derive(Clone)]
pub struct RetryPolicy {
    delay_plan: DelayPlan,
    filter: RetryFilter,
}

impl RetryPolicy {
    pub fn linear(count: u32, delay: Duration) -> Self {
        RetryPolicy {
            delay_plan: DelayPlan::FixedRepeat { count, delay },
            filter: RetryFilter::Default,
        }
    }

    pub fn explicit(delays: Vec<Duration>) -> Self {
        RetryPolicy {
            delay_plan: DelayPlan::Explicit(delays),
            filter: RetryFilter::Default,
        }
    }

    /// No retries: a single attempt, fail immediately on any error.
    pub fn none() -> Self {
        RetryPolicy::linear(0, Duration::ZERO)
    }

    pub fn with_whitelist(mut self, predicates: Vec<TypePredicate>) -> Self {
        self.filter = RetryFilter::Whitelist(predicates);
        self
    }

    pub fn with_blacklist(mut self, predicates: Vec<TypePredicate>) -> Self {
        self.filter = RetryFilter::Blacklist(predicates);
        self
    }

    pub fn with_predicate(mut self, f: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static) -> Self {
        self.filter = RetryFilter::Predicate(Arc::new(f));
        self
    }

    /// Convenience over [`with_whitelist`](Self::with_whitelist) for a single type.
    pub fn retry_on<E>(self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.with_whitelist(vec![type_predicate::<E>()])
    }

    /// Convenience over [`with_blacklist`](Self::with_blacklist) for a single type.
    pub fn except<E>(self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.with_blacklist(vec![type_predicate::<E>()])
    }

    fn is_retryable(&self, err: &anyhow::Error) -> bool {
        match &self.filter {
            RetryFilter::Whitelist(preds) => preds.iter().any(|p| p(err)),
            RetryFilter::Blacklist(preds) => !preds.iter().any(|p| p(err)),
            RetryFilter::Predicate(p) => p(err),
            RetryFilter::Default => !is_fail_fast(err),
        }
    }

    /// Runs `attempt` up to the delay plan's attempt count, honoring
    /// `cancel` while waiting between attempts and invoking `on_retry`
    /// before each retry (spec §4.2 ordering).
    ///
    /// On exhaustion, returns an [`AggregateError`] wrapping every
    /// collected failure. Non-retryable and fail-fast errors are
    /// returned as-is, attempt count 1, so callers can still classify
    /// the concrete error (e.g. detect a timeout marker).
    pub async fn execute<T, F, Fut, R, FutR>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
        mut on_retry: R,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        R: FnMut(u32, &anyhow::Error, Duration) -> FutR,
        FutR: Future<Output = ()>,
    {
        let delays = self.delay_plan.delays();
        let mut errors = Vec::new();

        for (attempt_index, delay) in std::iter::once(None)
            .chain(delays.into_iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay {
                let attempt_number = attempt_index as u32; // 1-based: prior failure count
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(EverTaskError::Cancelled.into());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Some(last) = errors.last() {
                    on_retry(attempt_number, last, delay).await;
                }
            }

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if is_fail_fast(&err) || !self.is_retryable(&err) {
                        return Err(err);
                    }
                    errors.push(err);
                }
            }
        }

        Err(AggregateError(errors).into())
    }
}

/// Cancellation and timeout always fail fast, regardless of the
/// configured filter (spec §4.2, §7).
pub fn is_fail_fast(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EverTaskError>(),
        Some(EverTaskError::Timeout) | Some(EverTaskError::Cancelled)
    )
}

/// Wraps every exception collected across a retry sequence (spec §4.2
/// "on exhaustion, throw an aggregate").
#[derive(Debug)]
pub struct AggregateError(pub Vec<anyhow::Error>);

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retry policy exhausted after {} attempt(s)", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            write!(f, "; attempt {}: {e}", i + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

//! Retry policies for long-running batch work.
//!
//! Both retry sites in the pipeline retry forever: a network fetch that keeps timing out
//! and a database flush that keeps deadlocking stall the worker instead of dropping data.
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// `delay(k) = min(base * 2^k, cap) + uniform(0, jitter)` for the k-th failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Option<Duration>,
    jitter: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn new(base: Duration) -> Self {
        Self {
            base,
            cap: None,
            jitter: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Range fetches: 1s, 2s, 4s, ... with no cap and no jitter.
    pub const fn fetch() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Batch flushes: exponential capped at five minutes, plus up to ten seconds of
    /// jitter so workers that deadlocked against each other retry at different times.
    pub const fn flush() -> Self {
        Self::new(Duration::from_secs(1))
            .with_cap(Duration::from_secs(300))
            .with_jitter(Duration::from_secs(10))
    }

    pub const fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Gives up after `attempts` failures. Policies are unbounded unless this is set.
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Deterministic part of the delay after the `attempt`-th failure (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.base.saturating_mul(factor);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fetch()
    }
}

/// Runs `op` until it succeeds, sleeping between retryable failures.
///
/// Errors for which `retryable` returns false are returned immediately, as is the last
/// error once the policy's attempt limit (if any) is exhausted.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    what: &str,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => {
                let sleep_time = policy.delay(failures);
                failures += 1;
                if policy.exhausted(failures) {
                    tracing::error!(what, failures, error = %e, "giving up after repeated failures");
                    return Err(e);
                }
                tracing::warn!(
                    what,
                    failures,
                    error = %e,
                    sleep_secs = sleep_time.as_secs_f64(),
                    "retrying after transient failure"
                );
                tokio::time::sleep(sleep_time).await;
            }
            Err(e) => return Err(e),
        }
    }
}

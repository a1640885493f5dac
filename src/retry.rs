//! Retry, backoff, and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. [`RetryPolicy`] bounds
//! request retries for the streaming HTTP client, while [`ReconnectPolicy`]
//! drives the realtime manager's open-ended reconnect schedule. Both share
//! the same capped exponential growth and lightweight jitter.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::error::Elapsed;
use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a low-latency default suitable for short-lived API requests.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(100),
            jitter: Duration::from_millis(25),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        exponential_delay(self.initial_backoff, self.max_backoff, attempt)
            + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::low_latency()
    }
}

/// Reconnect schedule for a long-lived channel.
///
/// Unlike [`RetryPolicy`] there is no attempt limit unless `max_attempts` is
/// set explicitly; the channel keeps trying until it is closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Cap applied to the exponential part of the delay.
    pub max_delay: Duration,
    /// Ceiling of the uniform jitter added on top of the capped delay.
    pub jitter: Duration,
    /// Optional number of consecutive failures after which reconnecting stops.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay without jitter: `min(max_delay, base_delay * 2^(attempt - 1))`.
    ///
    /// `attempt` is 1-based; `0` is treated like `1`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        exponential_delay(self.base_delay, self.max_delay, attempt)
    }

    /// Delay to wait before reconnect attempt `attempt`, jitter included.
    ///
    /// Always within `base_delay_for_attempt(attempt) ..= that + jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay_for_attempt(attempt) + jitter_duration(self.jitter, attempt)
    }

    /// Returns `true` once `attempt` consecutive failures exceed the cap.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Bounds `future` by `timeout`.
pub async fn with_timeout<F>(timeout: Duration, future: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    tokio::time::timeout(timeout, future).await
}

fn exponential_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    std::cmp::min(initial.saturating_mul(1u32 << exponent), max)
}

/// Fibonacci hashing multiplier; spreads consecutive attempts apart.
const ATTEMPT_SPREAD: u64 = 0x9E37_79B9_7F4A_7C15;

/// Pseudo-random duration in `0..=ceiling`, seeded from the clock.
fn jitter_duration(ceiling: Duration, attempt: u32) -> Duration {
    let ceiling_nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
    if ceiling_nanos == 0 {
        return Duration::ZERO;
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| u64::from(since_epoch.subsec_nanos()))
        .unwrap_or_default();
    let spread = seed ^ u64::from(attempt).wrapping_mul(ATTEMPT_SPREAD);
    Duration::from_nanos(spread % ceiling_nanos.saturating_add(1))
}

//! Bounded retry with exponential backoff.
//!
//! Knows nothing about plugins: the caller supplies the operation, the
//! policy and the predicate deciding which errors are worth another attempt.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub base: Duration,
    /// Factor applied for each further attempt.
    pub multiplier: u32,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Backoff {
    /// No delay between attempts.
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            multiplier: 1,
            max: Duration::ZERO,
        }
    }

    /// Doubling delays starting at `base`, capped at `max`.
    pub const fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            multiplier: 2,
            max,
        }
    }

    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Attempt ceiling plus backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A single attempt, never retried.
    pub const fn once() -> Self {
        Self::new(1, Backoff::none())
    }
}

/// A successful result and the attempt it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// The last error after giving up.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, the predicate rejects its error, or
/// the policy's attempt ceiling is reached.
///
/// `operation` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<Attempted<T>, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) if attempt < max_attempts && should_retry(&error) => {
                let delay = policy.backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(error) => {
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}

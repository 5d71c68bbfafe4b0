//! Bounded retry with exponential backoff and an injectable clock.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Source of delays. Production code sleeps on tokio; tests record instead.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that returns immediately and remembers every requested delay.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// The remote asked us to slow down; waits longer than a generic failure.
    RateLimited { retry_after: Option<Duration> },
    NonRetryable,
}

pub trait Classify {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Added on top of the regular backoff after a rate-limit signal.
    pub rate_limit_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            rate_limit_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn delay_for(&self, attempt_index: usize, disposition: RetryDisposition) -> Duration {
        match disposition {
            RetryDisposition::Retryable => self.delay_for_attempt(attempt_index),
            RetryDisposition::RateLimited { retry_after } => {
                let backoff = self
                    .rate_limit_delay
                    .saturating_add(self.delay_for_attempt(attempt_index));
                backoff.max(retry_after.unwrap_or_default())
            }
            RetryDisposition::NonRetryable => Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { attempts: usize, error: E },
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Permanent { attempts: usize, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Permanent { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Permanent { error, .. } => error,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or `max_attempts` is spent.
///
/// `op` receives the zero-based attempt index. Delays between attempts go
/// through `clock`, so no real time passes under a [`ManualClock`].
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    clock: &dyn Clock,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Classify + fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let disposition = error.disposition();
        let attempts = attempt + 1;
        if disposition == RetryDisposition::NonRetryable {
            return Err(RetryError::Permanent { attempts, error });
        }
        if attempts >= max_attempts {
            return Err(RetryError::Exhausted { attempts, error });
        }

        let delay = policy.delay_for(attempt, disposition);
        warn!(
            label,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            rate_limited = matches!(disposition, RetryDisposition::RateLimited { .. }),
            "attempt failed, backing off: {error}"
        );
        clock.sleep(delay).await;
        attempt += 1;
    }
}

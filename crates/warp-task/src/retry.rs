//! Exponential backoff around a fallible async operation.
//!
//! A [`Backoff`] pairs a [`BackoffConfig`] with a classifier mapping each
//! error to a [`RetryDecision`]. [`Backoff::run`] keeps calling the
//! operation until it succeeds, the classifier calls the error permanent,
//! the bounds are exhausted or the cancellation token fires.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounds of the exponential schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Give up once the next wait would end past this much total time.
    pub max_elapsed: Option<Duration>,
    /// Give up after this many retryable failures.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_elapsed: Some(Duration::from_secs(60)),
            max_attempts: None,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient: wait the next exponential interval.
    Retry,
    /// Not ready yet: wait exactly this long. Does not grow the interval.
    RetryAfter(Duration),
    /// Can never succeed.
    Permanent,
    /// Shutdown in progress: stop without reporting an error.
    Shutdown,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("permanent failure: {0}")] Permanent(E),
    #[error("gave up after {attempts} attempts: {last}")] Exhausted { last: E, attempts: u32 },
    #[error("cancelled")] Cancelled,
}

/// Retry policy: schedule plus error classifier.
#[derive(Clone, Debug)]
pub struct Backoff<C> {
    config: BackoffConfig,
    classify: C,
}

impl<C> Backoff<C> {
    pub fn new(config: BackoffConfig, classify: C) -> Self {
        Self { config, classify }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Wait before the retry following the `failures`-th failure (zero based).
    pub fn interval(&self, failures: u32) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(failures.min(64) as i32);
        let secs = self.config.initial_interval.as_secs_f64() * factor;
        let max = self.config.max_interval.as_secs_f64();
        Duration::from_secs_f64(secs.min(max))
    }

    /// Run `op` until it succeeds or the policy gives up.
    pub async fn run<T, E, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        C: Fn(&E) -> RetryDecision,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let mut failures = 0u32;
        let mut attempts = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempts += 1;

            let err = tokio::select! {
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                res = op() => match res {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                },
            };

            let delay = match (self.classify)(&err) {
                RetryDecision::Shutdown => return Err(RetryError::Cancelled),
                RetryDecision::Permanent => return Err(RetryError::Permanent(err)),
                RetryDecision::RetryAfter(delay) => delay,
                RetryDecision::Retry => {
                    let delay = self.interval(failures);
                    failures += 1;
                    if self.config.max_attempts.is_some_and(|max| failures >= max) {
                        return Err(RetryError::Exhausted { last: err, attempts });
                    }
                    delay
                }
            };

            if let Some(max) = self.config.max_elapsed {
                if started.elapsed() + delay > max {
                    return Err(RetryError::Exhausted { last: err, attempts });
                }
            }

            debug!(attempt = attempts, ?delay, error = %err, "retry: backing off");
            tokio::select! {
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

//! Bounded exponential backoff.

use std::time::Duration;

use bookchat_core::{Clock, SyncConfig};
use bookchat_storage::RepositoryError;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread each delay uniformly over ±25%.
    pub jitter: bool,
}

/// The last error of an operation that was given up on.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: RepositoryError,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1 = first retry): `base * 2^(retry-1)`,
    /// capped at `max_delay`, then jittered.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        delay.mul_f64(factor)
    }

    /// Only errors that can clear up on their own are retried.
    #[must_use]
    pub fn is_retryable(err: &RepositoryError) -> bool {
        err.is_recoverable()
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Sleeps go through `clock`.
    ///
    /// # Errors
    /// The last error together with how many attempts were made.
    pub fn run<T, F>(&self, clock: &dyn Clock, what: &str, mut op: F) -> Result<(T, u32), RetryFailure>
    where
        F: FnMut() -> Result<T, RepositoryError>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok((value, attempt)),
                Err(error) if attempt < max && Self::is_retryable(&error) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = max,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "retrying after transient failure"
                    );
                    bookchat_core::global_metrics().sync.retries_total.inc();
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

//! Retry policy and the executor that applies it to one logical call.
//!
//! Each attempt takes its own permit from the rate limiter, so retries are
//! throttled exactly like first attempts.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{ConfigError, GatewayError, ProducerError};
use crate::limiter::RateLimiter;

/// Status codes retried by default: rate limiting and transient server errors.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// How the wait grows between consecutive retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// `base * 2^(n-1)` after the n-th failed attempt.
    #[default]
    Exponential,
    /// `base * n` after the n-th failed attempt.
    Linear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable_statuses: BTreeSet<u16>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                requirement: "at least 1",
            });
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay",
                requirement: "no greater than retry.max_delay",
            });
        }
        Ok(())
    }

    /// Wait after the `attempt`-th failed attempt (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.checked_mul(factor)
            }
            Backoff::Linear => self.base_delay.checked_mul(attempt),
        };
        delay.unwrap_or(self.max_delay).min(self.max_delay)
    }

    pub fn is_retryable(&self, err: &ProducerError) -> bool {
        match err {
            ProducerError::Timeout(_) | ProducerError::Connection(_) => true,
            ProducerError::Status { status, .. } => self.retryable_statuses.contains(status),
            ProducerError::Payload(_) | ProducerError::InvalidRequest(_) => false,
        }
    }
}

/// Runs a producer under a retry policy, taking a rate-limit permit per attempt.
pub struct RetryExecutor {
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    pub fn new(limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Self {
        Self { limiter, clock }
    }

    /// Attempt `producer` up to `policy.max_attempts` times.
    ///
    /// `key` only labels log lines. A server `Retry-After` replaces the
    /// computed backoff for that wait. No wait follows the final attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        mut producer: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let permit = self.limiter.acquire().await;
            if !permit.waited.is_zero() {
                tracing::debug!(key, attempt, waited_ms = permit.waited.as_millis() as u64, "Permit granted after wait");
            }

            let err = match producer().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !policy.is_retryable(&err) {
                tracing::warn!(key, attempt, error = %err, "Terminal failure, not retrying");
                return Err(GatewayError::Terminal {
                    attempts: attempt,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                tracing::warn!(key, attempts = attempt, error = %err, "Retries exhausted");
                return Err(GatewayError::ExhaustedRetries {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = err.retry_after().unwrap_or_else(|| policy.delay_for(attempt));
            tracing::warn!(
                key,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                status = err.status_code(),
                error = %err,
                "Retryable failure, backing off"
            );
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }
}

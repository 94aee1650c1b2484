//! Rate-limited call gate for Varnika.
//!
//! Every call to an external service (search, page fetch, language model)
//! goes through [`RateLimitGate::call`]. A `RateLimited` answer is retried
//! with exponential backoff plus jitter; any other failure is returned at
//! once. Each attempt has its own timeout and the whole retry loop has a
//! wall-clock cap, so a single call can never hang a stage.

pub mod http;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use varnika_shared::{Result, RetryConfig, UpstreamError, VarnikaError};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Backoff parameters for one gate.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed (0.2 = +/-20%).
    pub jitter: f64,
    pub attempt_timeout: Duration,
    pub overall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 0.99),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            overall_timeout: Duration::from_secs(config.overall_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Apply random jitter to a delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + factor)
    }
}

/// Attempt counter for a single `call`; never shared between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackoffState {
    /// Attempts made so far.
    pub attempts: u32,
}

impl BackoffState {
    /// Record a rate-limited attempt and compute the delay before the next one.
    /// Returns `None` once the attempt budget is spent.
    fn next_delay(
        &mut self,
        policy: &RetryPolicy,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= policy.max_attempts {
            return None;
        }
        let computed = policy.jittered(policy.backoff_delay(self.attempts - 1));
        // A server-provided Retry-After wins when it asks for longer.
        Some(match retry_after {
            Some(hint) => computed.max(hint.min(policy.max_delay)),
            None => computed,
        })
    }
}

// ---------------------------------------------------------------------------
// RateLimitGate
// ---------------------------------------------------------------------------

/// Wraps calls to an external capability with the retry policy.
#[derive(Debug, Clone, Default)]
pub struct RateLimitGate {
    policy: RetryPolicy,
}

impl RateLimitGate {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget, deadline or cancellation ends the loop.
    ///
    /// `op` is invoked once per attempt and must build a fresh request each time.
    #[instrument(skip_all, fields(operation = %operation))]
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let deadline = Instant::now() + self.policy.overall_timeout;
        let mut state = BackoffState::default();

        loop {
            if cancel.is_cancelled() {
                return Err(VarnikaError::Cancelled);
            }
            let attempt = tokio::time::timeout(self.policy.attempt_timeout, op());
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VarnikaError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.overall_timeout(operation));
                }
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok(value)) => {
                    if state.attempts > 0 {
                        debug!(attempts = state.attempts + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(UpstreamError::RateLimited { retry_after })) => {
                    let Some(delay) = state.next_delay(&self.policy, retry_after) else {
                        warn!(attempts = state.attempts, "retry budget exhausted");
                        return Err(VarnikaError::RateLimitExceeded {
                            operation: operation.to_string(),
                            attempts: state.attempts,
                        });
                    };
                    warn!(
                        attempt = state.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(VarnikaError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(self.overall_timeout(operation));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(Err(other)) => return Err(other.into()),
                Err(_elapsed) => {
                    return Err(VarnikaError::Timeout(format!(
                        "{operation} attempt exceeded {}s",
                        self.policy.attempt_timeout.as_secs_f64()
                    )));
                }
            }
        }
    }

    fn overall_timeout(&self, operation: &str) -> VarnikaError {
        VarnikaError::Timeout(format!(
            "{operation} exceeded overall limit of {}s",
            self.policy.overall_timeout.as_secs_f64()
        ))
    }
}

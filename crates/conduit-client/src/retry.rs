// Retry policies: decide whether a failed resource is retried and after how long.
use crate::config::{RetryMode, RetryOptions};
use crate::error::ConduitError;
use conduit_wire::conditions;
use std::sync::Arc;
use std::time::Duration;

/// Extra wait applied when the broker reports it is busy.
pub(crate) const SERVER_BUSY_WAIT: Duration = Duration::from_secs(4);

/// `decide(error, attempt)` returns the backoff before the next attempt, or
/// `None` to fail permanently. `attempt` starts at 1 for the first failure.
pub trait RetryPolicy: Send + Sync + 'static {
    fn decide(&self, error: &ConduitError, attempt: u32) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&ConduitError, u32) -> Option<Duration> + Send + Sync + 'static,
{
    fn decide(&self, error: &ConduitError, attempt: u32) -> Option<Duration> {
        self(error, attempt)
    }
}

/// Same delay for every attempt.
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    options: RetryOptions,
}

impl FixedRetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn decide(&self, error: &ConduitError, attempt: u32) -> Option<Duration> {
        if !should_retry(&self.options, error, attempt) {
            return None;
        }
        Some(with_busy_wait(
            error,
            self.options.delay.min(self.options.max_delay),
        ))
    }
}

/// `delay * 2^(attempt - 1)`, capped at `max_delay`.
///
/// ```
/// use conduit_client::{ConduitError, ExponentialRetryPolicy, RetryOptions, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = ExponentialRetryPolicy::new(RetryOptions {
///     delay: Duration::from_millis(100),
///     ..RetryOptions::default()
/// });
/// let err = ConduitError::Transient("reset".into());
/// assert_eq!(policy.decide(&err, 1), Some(Duration::from_millis(100)));
/// assert_eq!(policy.decide(&err, 3), Some(Duration::from_millis(400)));
/// assert_eq!(policy.decide(&err, 4), None);
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    options: RetryOptions,
}

impl ExponentialRetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn decide(&self, error: &ConduitError, attempt: u32) -> Option<Duration> {
        if !should_retry(&self.options, error, attempt) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .options
            .delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.options.max_delay)
            .min(self.options.max_delay);
        Some(with_busy_wait(error, delay))
    }
}

pub fn retry_policy(options: &RetryOptions) -> Arc<dyn RetryPolicy> {
    match options.mode {
        RetryMode::Fixed => Arc::new(FixedRetryPolicy::new(options.clone())),
        RetryMode::Exponential => Arc::new(ExponentialRetryPolicy::new(options.clone())),
    }
}

fn should_retry(options: &RetryOptions, error: &ConduitError, attempt: u32) -> bool {
    attempt > 0 && attempt <= options.max_retries && error.is_transient()
}

fn with_busy_wait(error: &ConduitError, delay: Duration) -> Duration {
    match error {
        ConduitError::Protocol(condition) if condition.condition == conditions::SERVER_BUSY => {
            delay + SERVER_BUSY_WAIT
        }
        _ => delay,
    }
}

//! Bounded, cancellation-aware retry for provider calls (§4.2).
//!
//! Unlike a generic retry helper, this one does not decide retryability itself — the caller
//! supplies an `is_retryable` predicate (usually [`crate::cloudllm::error::ProviderError::is_retryable`])
//! so the retry engine stays decoupled from the error taxonomy.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `delay * attempt`. The default for every provider except Anthropic and Google.
    Linear,
    /// `delay * 2^(attempt - 1)`. Anthropic and Google opt into this.
    Exponential,
}

/// Retry policy for one [`retry`] call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryConfig {
            max_attempts,
            base_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(mut self) -> Self {
        self.strategy = BackoffStrategy::Exponential;
        self
    }

    /// Delay before the given attempt number (1-indexed: the wait *before retrying* attempt N).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Linear => self.base_delay * attempt,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(31);
                self.base_delay * 2u32.saturating_pow(exp)
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::new(3, Duration::from_millis(500))
    }
}

/// Outcome of a cancelled retry loop, distinct from the operation's own error type so callers
/// can tell "the operation failed" from "the ambient context was cancelled mid-retry".
#[derive(Debug)]
pub enum RetryOutcome<E> {
    Failed(E),
    Cancelled,
}

/// Run `operation` up to `config.max_attempts` times, retrying only while `is_retryable(&err)` is
/// true, sleeping `config.delay_for_attempt(attempt)` between attempts, and aborting immediately
/// (without sleeping or retrying again) if `cancel` fires.
pub async fn retry<T, E, Op, Fut, IsRetryable>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    is_retryable: IsRetryable,
    mut operation: Op,
) -> Result<T, RetryOutcome<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    IsRetryable: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryOutcome::Cancelled);
        }

        let result = operation(attempt).await;
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = is_retryable(&err);
                if !retryable || attempt >= config.max_attempts {
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!(
                            "retry exhausted or non-retryable after attempt {}/{} (retryable={})",
                            attempt,
                            config.max_attempts,
                            retryable
                        );
                    }
                    return Err(RetryOutcome::Failed(err));
                }

                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "attempt {}/{} failed, retrying in {:?}",
                    attempt,
                    config.max_attempts,
                    delay
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled),
                }

                attempt += 1;
            }
        }
    }
}

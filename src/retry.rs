//! Opt-in retry wrapper.
//!
//! Nothing in the crate retries on its own. Callers wrap whichever operation they want
//! repeated:
//!
//! ```no_run
//! # use kagi_llm::retry::{retry, RetryPolicy};
//! # use kagi_llm::{ServiceClient, types::{ChatOptions, Message}};
//! # async fn demo(client: &ServiceClient) -> Result<(), kagi_llm::LLMError> {
//! let messages = vec![Message::user("hello")];
//! let options = ChatOptions::default();
//! let policy = RetryPolicy::exponential(3, std::time::Duration::from_millis(500), 2.0);
//! let response = retry(&policy, || client.chat_complete(&messages, &options)).await?;
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::error::LLMError;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: f64 },
}

/// Attempt budget and delay schedule for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound for any single sleep.
    pub max_delay: Duration,
    /// Honor a provider-supplied `Retry-After` when it exceeds the computed delay.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(4, Duration::from_secs(1), 2.0)
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff: Backoff::Fixed,
            max_delay: Duration::from_secs(60),
            respect_retry_after: true,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, factor: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff: Backoff::Exponential { factor },
            max_delay: Duration::from_secs(60),
            respect_retry_after: true,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to sleep after the failed attempt with the given zero-based index.
    pub fn delay_for(&self, attempt: u32, error: &LLMError) -> Duration {
        let computed = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential { factor } => {
                let scaled = self.initial_delay.as_secs_f64() * factor.powi(attempt as i32);
                if scaled.is_finite() && scaled >= 0.0 {
                    Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
                } else {
                    self.max_delay
                }
            }
        };
        let delay = match error.retry_after() {
            Some(hint) if self.respect_retry_after && hint > computed => hint,
            _ => computed,
        };
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy runs out
/// of attempts. Retryability is decided by [`LLMError::is_retryable`].
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, LLMError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
{
    retry_if(policy, LLMError::is_retryable, op).await
}

/// Like [`retry`] with a caller-supplied predicate selecting which errors to retry.
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    mut should_retry: P,
    mut op: F,
) -> Result<T, LLMError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
    P: FnMut(&LLMError) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts || !should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1, &err);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying failed operation"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Extracts the `Retry-After` header (in seconds) if present.
///
/// HTTP-date values are ignored because vendors primarily use the numeric form.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

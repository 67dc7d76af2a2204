//! Bounded retries with backoff for individual provider calls.

use std::time::Duration;

use cardstream_types::{Result, StreamError};

/// Delay between attempts against the same provider.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    None,
}

impl BackoffPolicy {
    /// Delay before retrying after the given (0-indexed) attempt failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                base.saturating_mul(factor).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
        }
    }
}

/// Run `f` up to `max_retries + 1` times, sleeping between attempts while the
/// error is [`StreamError::is_retryable`]. Non-retryable errors return at once.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    provider: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    provider,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Image provider failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shorthand used by providers to report a retryable failure.
pub fn provider_failure(card: &cardstream_types::CardId, message: impl Into<String>) -> StreamError {
    StreamError::ImageGenerationFailure {
        card: card.clone(),
        message: message.into(),
    }
}

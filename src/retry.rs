//! Retry policies and backoff
//!
//! Two policies live here: the fallback policy applied by the reply
//! generator to a single turn, and the backoff used between transcription
//! session restarts.

use std::time::{Duration, SystemTime};

/// Backoff between repeated attempts of the same operation
///
/// Used by the orchestrator between session restarts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Model selection for one turn of reply generation
///
/// A turn tries `primary` first and, only if that attempt fails with a
/// retryable error, tries `fallback` once after `backoff`.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    /// Model asked first
    pub primary: String,
    /// Model asked after a retryable failure of the primary
    pub fallback: Option<String>,
    /// Pause before the fallback attempt
    pub backoff: Duration,
}

impl FallbackPolicy {
    /// Models to try, in order. Never more than two.
    #[must_use]
    pub fn models(&self) -> Vec<&str> {
        let mut models = vec![self.primary.as_str()];
        if let Some(fallback) = self.fallback.as_deref() {
            models.push(fallback);
        }
        models
    }

    /// Total attempts a turn may make
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        if self.fallback.is_some() { 2 } else { 1 }
    }
}

/// Determine whether an HTTP status and response body indicate a recoverable error.
///
/// Recoverable errors are worth retrying: rate limits (429), server errors (5xx),
/// and certain transient network-level failures surfaced in the body text.
/// Hosted inference answers 503 while a model is still loading.
#[must_use]
pub fn is_recoverable(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }

    if (500..600).contains(&status) {
        return true;
    }

    let lower = body.to_lowercase();
    lower.contains("currently loading")
        || lower.contains("connection reset")
        || lower.contains("timed out")
}

/// Compute the delay before the next attempt.
///
/// The delay follows exponential backoff:
/// `min(base_delay * 2^attempt + jitter, max_delay)`.
///
/// Jitter is 0-25% of the computed delay, derived from `SystemTime` to avoid
/// pulling a random number generator into the hot path.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    // Scale to 0-25% of the base delay
    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

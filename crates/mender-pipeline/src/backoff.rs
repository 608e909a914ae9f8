//! Capped exponential backoff between a fixer invocation and the gate re-run.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for any single wait.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Backoff policy controlling the delay between retry attempts.
///
/// Deliberately jitter-free so wait sequences are reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `min(base * 2^retry_index, max)`.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given retry index (0 for the first retry).
    pub fn delay(&self, retry_index: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential { base, max } => 2u32
                .checked_pow(retry_index)
                .and_then(|factor| base.checked_mul(factor))
                .map_or(*max, |d| d.min(*max)),
            BackoffPolicy::None => Duration::ZERO,
        }
    }

    /// The first `retries` delays, in order.
    pub fn schedule(&self, retries: u32) -> Vec<Duration> {
        (0..retries).map(|i| self.delay(i)).collect()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: BASE_TIMEOUT,
            max: MAX_TIMEOUT,
        }
    }
}

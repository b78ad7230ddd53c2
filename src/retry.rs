//! Bounded exponential backoff and cancellable waiting.
//!
//! Used in two places: the orchestrator's retry of transient stage failures,
//! and the Account Classifier's job polling. Both must stop promptly when the
//! run's [`CancellationToken`] fires.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// How many times a retryable stage failure is re-attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Backoff::new(
                Duration::from_millis(initial_backoff_ms),
                Duration::from_secs(8),
            ),
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, 0)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, 500)
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` when the sleep was interrupted by cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

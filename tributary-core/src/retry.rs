//! Exponential backoff and a cancellable retry loop for the transient failures of the offset
//! store and the partition reader.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Result;

/// Exponential backoff iterator. The n-th delay is `base_interval * factor^(n - 1)`, randomized
/// by `jitter` and capped at `max_interval`. Yields `max_retries` delays, or forever when unset.
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    /// Randomization in `[0.0, 1.0]`, the delay is scaled by a factor in `1 ± jitter`.
    jitter: f64,
    max_retries: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_retries: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_retries,
            attempt: 0,
        }
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.max(1) - 1);
        let mut delay_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            delay_ms *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }

        // f64 to u64 saturates, so a huge exponent is simply capped below.
        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_retries) = self.max_retries
            && self.attempt >= max_retries
        {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, the backoff runs out or
/// `cancel` fires. Cancellation, observed both while the operation is in flight and while
/// sleeping, yields `Ok(None)`. An exhausted backoff returns the last error.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    backoff: impl IntoIterator<Item = Duration>,
    cancel: &CancellationToken,
    description: &str,
    mut operation: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = backoff.into_iter();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        let Some(delay) = backoff.next() else {
            return Err(err);
        };
        warn!(
            error = %err,
            attempt,
            ?delay,
            "{description} failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

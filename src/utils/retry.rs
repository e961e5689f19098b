//! Retry utilities for bounded waits
//!
//! Channel discovery after a spawn and the acknowledgment wait after a
//! best-effort Close/Kill are both expressed as a retry budget: a maximum
//! number of attempts with a delay between them.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt (1.0 = fixed delay)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(50, Duration::from_millis(100))
    }
}

impl RetryConfig {
    /// Create a new retry configuration with exponential backoff
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Fixed delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Default budget for Close/Kill acknowledgments
    pub fn release() -> Self {
        Self::fixed(10, Duration::from_millis(50))
    }

    /// Delay that follows `delay`
    pub fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(
            Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier),
            self.max_delay,
        )
    }

    /// Upper bound on the total time spent sleeping
    pub fn total_budget(&self) -> Duration {
        let mut delay = self.initial_delay;
        let mut total = Duration::ZERO;
        for _ in 0..self.max_attempts {
            total += delay;
            delay = self.next_delay(delay);
        }
        total
    }
}

/// Retry an async operation with backoff
pub async fn retry_async_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= config.max_attempts => return Err(e),
            Err(e) => {
                tracing::debug!(
                    "Async operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    config.max_attempts,
                    e,
                    delay
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Sleep, then probe, up to `max_attempts` times
///
/// Returns the first `Some` the probe yields, or `None` once the budget is
/// spent. The probe is never called before the first delay has elapsed.
pub async fn poll_until<F, Fut, T>(config: &RetryConfig, mut probe: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut delay = config.initial_delay;
    for attempt in 1..=config.max_attempts {
        sleep(delay).await;
        if let Some(found) = probe(attempt).await {
            return Some(found);
        }
        delay = config.next_delay(delay);
    }
    None
}

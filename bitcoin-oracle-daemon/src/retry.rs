//! Exponential backoff around fallible async operations

use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::config::RetryConfig;

/// How often and how patiently to retry an operation.
///
/// The first attempt runs immediately; retry `n` waits
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt and is at least 1. A
    /// multiplier below 1 is treated as 1.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Runs `attempt` until it succeeds, fails with an error `retryable`
    /// rejects, or the attempts run out. The last error is returned.
    pub async fn run<T, E, F, Fut, P>(&self, operation: &str, mut attempt: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if attempts < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    warn!(
                        "{} failed (attempt {} of {}): {}; retrying in {}ms",
                        operation,
                        attempts,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    if attempts > 1 {
                        error!("{} failed after {} attempts: {}", operation, attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

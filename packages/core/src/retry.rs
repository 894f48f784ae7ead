// ABOUTME: Bounded exponential backoff for transient store and sandbox failures
// ABOUTME: Errors opt in through the Transient trait; everything else fails fast

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Implemented by error types that can tell a retryable failure apart from a
/// permanent one.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all; the first failure is returned
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = base_delay.min(self.max_delay_ms as f64) as u64;

        if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter_factor = rng.gen_range(0.5..=1.5);
            (delay as f64 * jitter_factor) as u64
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or `max_attempts`
/// is exhausted. Only errors reporting `is_transient()` are retried.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay_ms = config.calculate_delay(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

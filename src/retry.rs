use std::future::Future;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Backoff policy for transient provider failures.
///
/// Lives in the pipeline config and is injected into the OCR and structuring
/// clients, so tests exercise retry behavior without real network calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to sleep after the given 1-based attempt fails:
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.base_delay.mul_f64(factor.max(0.0));
        delay.min(self.max_delay)
    }
}

/// Runs `operation` under `policy`, retrying only errors the predicate marks
/// as transient. The final error is returned unchanged once attempts are
/// exhausted or a non-retryable error appears.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    what, attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

//! Bounded retry with exponential backoff.

use crate::error::{Error, Result};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry policy for establishing a broker connection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt. Doubles after each further failure.
    pub base_delay: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// Each attempt is bounded by `attempt_timeout`. No delay follows the final
/// attempt, so a run that succeeds on attempt `k` waits exactly
/// `delay_after(1) + .. + delay_after(k - 1)`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(attempt, "{} succeeded after retry", label);
                }
                return Ok(value);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", policy.attempt_timeout),
        }

        if attempt < attempts {
            let delay = policy.delay_after(attempt);
            warn!(
                attempt,
                max_attempts = attempts,
                ?delay,
                error = %last_error,
                "{} failed, retrying",
                label
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(Error::Connect {
        attempts,
        reason: last_error,
    })
}

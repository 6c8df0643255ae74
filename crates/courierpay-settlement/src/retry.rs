//! Bounded retry with exponential backoff
//!
//! One uniform helper for transient external failures instead of ad hoc
//! retries at each call site. Only errors the taxonomy marks retriable are
//! re-attempted; callers reuse the same idempotency key across attempts so
//! a retry can never double-move money.

use std::future::Future;
use std::time::Duration;

use courierpay_types::Result;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-based) attempt's retry: base * 2^(n-1)
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `operation`, retrying retriable errors up to the policy's bound.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(operation = label, attempt, error = %err, delay_ms = delay.as_millis() as u64,
                      "Retriable failure, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

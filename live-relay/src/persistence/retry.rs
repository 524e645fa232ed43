//! Retry helper for repository writes.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::Result;
use crate::config::PersistenceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry `attempt` (1-based), plus up to a
    /// quarter of jitter, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let shift = attempt.saturating_sub(1).min(20);
        let capped_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(max_ms))
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached, returning
/// the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    error = %err,
                    "Write failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

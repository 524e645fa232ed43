//! Restart budget and backoff for ingestion processes.
//!
//! Each stream's failures are counted inside a sliding window. While the
//! number of recent failures stays within the stream's restart budget the
//! process is relaunched after `base * 2^(n-1)` (capped at `max_backoff`);
//! one failure past the budget exhausts the stream.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 10;

#[derive(Debug, Clone)]
pub struct RestartTrackerConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub failure_window: Duration,
}

impl From<&IngestConfig> for RestartTrackerConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            base_backoff: config.backoff_base(),
            max_backoff: config.backoff_max(),
            failure_window: config.retry_window(),
        }
    }
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch after `backoff`; `attempt` is the 1-based restart number
    /// within the window.
    Restart { attempt: usize, backoff: Duration },
    /// The budget is spent.
    Exhausted { failures: usize },
}

/// Failure history of one stream's ingestion.
#[derive(Debug)]
pub struct RestartTracker {
    stream_id: String,
    config: RestartTrackerConfig,
    failures: Vec<Instant>,
    total_restarts: u64,
}

impl RestartTracker {
    pub fn new(stream_id: impl Into<String>, config: RestartTrackerConfig) -> Self {
        Self {
            stream_id: stream_id.into(),
            config,
            failures: Vec::new(),
            total_restarts: 0,
        }
    }

    /// Record a failure and decide whether to relaunch.
    pub fn record_failure(&mut self, max_restarts: usize) -> RestartDecision {
        let now = Instant::now();
        let window = self.config.failure_window;
        self.failures.retain(|&t| now.duration_since(t) < window);
        self.failures.push(now);
        let failures = self.failures.len();

        if failures > max_restarts {
            warn!(
                stream_id = %self.stream_id,
                failures,
                max_restarts,
                "Ingestion restart budget exhausted"
            );
            return RestartDecision::Exhausted { failures };
        }

        self.total_restarts += 1;
        let backoff = self.calculate_backoff(failures);
        if failures == 1 {
            debug!(stream_id = %self.stream_id, ?backoff, "Ingestion failed, restarting");
        } else {
            info!(
                stream_id = %self.stream_id,
                failures,
                ?backoff,
                "Ingestion failed repeatedly, restarting with backoff"
            );
        }

        RestartDecision::Restart {
            attempt: failures,
            backoff,
        }
    }

    /// `base * 2^(failures - 1)`, capped.
    fn calculate_backoff(&self, failures: usize) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(MAX_EXPONENT as usize) as u32;
        let multiplier = 2u32.saturating_pow(exponent);
        self.config
            .base_backoff
            .saturating_mul(multiplier)
            .min(self.config.max_backoff)
    }

    pub fn recent_failures(&self) -> usize {
        let now = Instant::now();
        self.failures
            .iter()
            .filter(|&&t| now.duration_since(t) < self.config.failure_window)
            .count()
    }

    pub fn total_restarts(&self) -> u64 {
        self.total_restarts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(stream_id: &str) -> RestartTracker {
        RestartTracker::new(
            stream_id,
            RestartTrackerConfig {
                base_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(5),
                failure_window: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_restarts_then_exhausted() {
        let mut tracker = tracker("s1");

        assert_eq!(
            tracker.record_failure(3),
            RestartDecision::Restart {
                attempt: 1,
                backoff: Duration::from_millis(500)
            }
        );
        assert_eq!(
            tracker.record_failure(3),
            RestartDecision::Restart {
                attempt: 2,
                backoff: Duration::from_secs(1)
            }
        );
        assert_eq!(
            tracker.record_failure(3),
            RestartDecision::Restart {
                attempt: 3,
                backoff: Duration::from_secs(2)
            }
        );
        assert_eq!(
            tracker.record_failure(3),
            RestartDecision::Exhausted { failures: 4 }
        );
        assert_eq!(tracker.total_restarts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let mut tracker = tracker("s1");
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let RestartDecision::Restart { backoff, .. } = tracker.record_failure(100) {
                last = backoff;
            }
        }
        assert_eq!(last, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_expire_with_window() {
        let mut tracker = tracker("s1");
        for _ in 0..3 {
            tracker.record_failure(3);
        }
        assert_eq!(tracker.recent_failures(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.recent_failures(), 0);
        assert!(matches!(
            tracker.record_failure(3),
            RestartDecision::Restart { attempt: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trackers_are_independent() {
        let mut first = tracker("s1");
        let mut second = tracker("s2");
        for _ in 0..4 {
            first.record_failure(3);
        }
        assert!(matches!(
            second.record_failure(3),
            RestartDecision::Restart { attempt: 1, .. }
        ));
        assert_eq!(first.recent_failures(), 4);
        assert_eq!(second.recent_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_exhausts_immediately() {
        let mut tracker = tracker("s1");
        assert_eq!(
            tracker.record_failure(0),
            RestartDecision::Exhausted { failures: 1 }
        );
    }
}

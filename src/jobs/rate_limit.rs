//! Fixed-window request limiter keyed by caller identity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;
use crate::error::JobError;

/// Stale counters are swept once every this many checks.
const EVICT_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 30,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs.max(1) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindowCounter {
    pub caller_id: String,
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// Per-caller counters. The check and the increment happen under the
/// caller's entry lock, so concurrent requests cannot both take the last slot.
pub struct RateLimiter {
    config: RateLimitConfig,
    counters: DashMap<String, RateWindowCounter>,
    checks: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            checks: AtomicU64::new(0),
            clock,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take one slot for `caller_id`, returning how many remain in the
    /// window. Rejections leave the counter untouched.
    pub fn check(&self, caller_id: &str) -> Result<u32, JobError> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % EVICT_EVERY == EVICT_EVERY - 1 {
            self.evict_stale();
        }

        let now = self.clock.now();
        let window = self.config.window();

        let mut counter = self
            .counters
            .entry(caller_id.to_string())
            .or_insert_with(|| RateWindowCounter {
                caller_id: caller_id.to_string(),
                window_start: now,
                count: 0,
            });

        if now >= counter.window_start + window {
            counter.window_start = now;
            counter.count = 0;
        }

        if counter.count >= self.config.limit {
            let retry_after = (counter.window_start + window - now)
                .to_std()
                .unwrap_or_default();
            warn!(caller_id, limit = self.config.limit, "rate limit exceeded");
            return Err(JobError::RateLimitExceeded {
                caller_id: caller_id.to_string(),
                limit: self.config.limit,
                retry_after,
            });
        }

        counter.count += 1;
        Ok(self.config.limit - counter.count)
    }

    /// Drop counters whose window has passed. Returns how many were removed.
    pub fn evict_stale(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.window();
        let before = self.counters.len();
        self.counters.retain(|_, c| now < c.window_start + window);
        before.saturating_sub(self.counters.len())
    }

    /// Callers with a tracked window.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Snapshot of a caller's window.
    pub fn counter(&self, caller_id: &str) -> Option<RateWindowCounter> {
        self.counters.get(caller_id).map(|c| c.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(limit: u32) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                limit,
                window_secs: 60,
            },
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[test]
    fn test_only_excess_requests_are_rejected() {
        let (limiter, _) = limiter(3);
        assert_eq!(limiter.check("cam").unwrap(), 2);
        assert_eq!(limiter.check("cam").unwrap(), 1);
        assert_eq!(limiter.check("cam").unwrap(), 0);
        for _ in 0..3 {
            assert!(matches!(
                limiter.check("cam"),
                Err(JobError::RateLimitExceeded { limit: 3, .. })
            ));
        }
        assert_eq!(limiter.counter("cam").unwrap().count, 3);
        assert!(limiter.check("other").is_ok());
    }

    #[test]
    fn test_window_resets() {
        let (limiter, clock) = limiter(1);
        limiter.check("cam").unwrap();
        clock.advance(Duration::seconds(45));
        match limiter.check("cam") {
            Err(JobError::RateLimitExceeded { retry_after, .. }) => {
                assert_eq!(retry_after, std::time::Duration::from_secs(15));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        clock.advance(Duration::seconds(15));
        assert!(limiter.check("cam").is_ok());
    }

    #[test]
    fn test_stale_counters_are_evicted() {
        let (limiter, clock) = limiter(5);
        for i in 0..20 {
            limiter.check(&format!("cam-{i}")).unwrap();
        }
        assert_eq!(limiter.len(), 20);

        clock.advance(Duration::seconds(61));
        for _ in 0..EVICT_EVERY {
            let _ = limiter.check("busy");
        }
        assert_eq!(limiter.len(), 1);
        assert!(limiter.counter("cam-0").is_none());
        assert_eq!(limiter.evict_stale(), 0);
    }
}

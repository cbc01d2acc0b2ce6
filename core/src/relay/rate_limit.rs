//! Rate Limiter — fixed-window point buckets per key

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use web_time::Instant;

/// Points and replenish window for one bucket family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Points available per window
    pub points: u32,
    /// Window after which the bucket is refilled
    pub window: Duration,
}

impl RateLimitConfig {
    /// Budget for socket events: 10 per second
    pub fn socket_events() -> Self {
        Self {
            points: 10,
            window: Duration::from_secs(1),
        }
    }

    /// Budget for the credential endpoint: 20 per second per caller
    pub fn credential_requests() -> Self {
        Self {
            points: 20,
            window: Duration::from_secs(1),
        }
    }
}

/// Outcome of a consume call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied until the current window ends
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    consumed: u32,
    window_start: Instant,
}

/// Per-key limiter
#[derive(Debug)]
pub struct RateLimiter<K> {
    config: RateLimitConfig,
    buckets: HashMap<K, Bucket>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Consume `cost` points for `key` now
    pub fn consume(&mut self, key: &K, cost: u32) -> RateDecision {
        self.consume_at(key, cost, Instant::now())
    }

    /// Consume `cost` points for `key` at a given instant
    pub fn consume_at(&mut self, key: &K, cost: u32, now: Instant) -> RateDecision {
        let window = self.config.window;
        let bucket = self.buckets.entry(key.clone()).or_insert(Bucket {
            consumed: 0,
            window_start: now,
        });

        if now.saturating_duration_since(bucket.window_start) >= window {
            bucket.consumed = 0;
            bucket.window_start = now;
        }

        // Denied calls count against the window too
        bucket.consumed = bucket.consumed.saturating_add(cost);
        if bucket.consumed <= self.config.points {
            RateDecision::Allowed
        } else {
            let elapsed = now.saturating_duration_since(bucket.window_start);
            RateDecision::Denied {
                retry_after: window.saturating_sub(elapsed),
            }
        }
    }

    /// Drop the bucket for a key that went away
    pub fn forget(&mut self, key: &K) {
        self.buckets.remove(key);
    }

    /// Drop buckets whose window has expired
    pub fn prune(&mut self) {
        self.prune_at(Instant::now());
    }

    pub fn prune_at(&mut self, now: Instant) {
        let window = self.config.window;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.window_start) < window);
    }

    /// Number of tracked keys
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(points: u32) -> RateLimiter<&'static str> {
        RateLimiter::new(RateLimitConfig {
            points,
            window: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_allows_up_to_budget() {
        let mut limiter = limiter(3);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.consume_at(&"a", 1, now).is_allowed());
        }
        assert!(!limiter.consume_at(&"a", 1, now).is_allowed());
    }

    #[test]
    fn test_retry_after_is_rest_of_window() {
        let mut limiter = limiter(1);
        let start = Instant::now();
        limiter.consume_at(&"a", 1, start);

        let decision = limiter.consume_at(&"a", 1, start + Duration::from_millis(400));
        assert_eq!(
            decision,
            RateDecision::Denied {
                retry_after: Duration::from_millis(600)
            }
        );
    }

    #[test]
    fn test_window_refills() {
        let mut limiter = limiter(2);
        let start = Instant::now();
        limiter.consume_at(&"a", 2, start);
        assert!(!limiter.consume_at(&"a", 1, start).is_allowed());

        let later = start + Duration::from_secs(1);
        assert!(limiter.consume_at(&"a", 1, later).is_allowed());
    }

    #[test]
    fn test_keys_are_independent() {
        let mut limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.consume_at(&"a", 1, now).is_allowed());
        assert!(!limiter.consume_at(&"a", 1, now).is_allowed());
        assert!(limiter.consume_at(&"b", 1, now).is_allowed());
    }

    #[test]
    fn test_cost_above_budget_denied() {
        let mut limiter = limiter(5);
        assert!(!limiter.consume_at(&"a", 6, Instant::now()).is_allowed());
    }

    #[test]
    fn test_forget_and_prune() {
        let mut limiter = limiter(1);
        let start = Instant::now();
        limiter.consume_at(&"a", 1, start);
        limiter.consume_at(&"b", 1, start);
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.prune_at(start + Duration::from_secs(2));
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_default_budgets() {
        assert_eq!(RateLimitConfig::socket_events().points, 10);
        assert_eq!(RateLimitConfig::credential_requests().points, 20);
    }
}

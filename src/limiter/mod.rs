//! Per-tenant token bucket rate limiting
//!
//! One bucket per `(tenant_id, endpoint_class)`. Each call refills the bucket
//! by `elapsed_seconds × refill_rate` (capped at capacity) and then tries to
//! take `cost` tokens. Contention is limited to the single bucket touched.
//!
//! A throttle is a routing signal: callers serve cached data when they have
//! it and only reject when they do not.
//!
//! Costs must be finite and non-negative; anything else is throttled without
//! touching the bucket.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bucket parameters for one endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum burst size
    pub capacity: f64,

    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 50.0,
        }
    }
}

/// Limits per endpoint class, with a fallback for unlisted classes
#[derive(Debug, Clone, Default)]
pub struct RateLimiterConfig {
    pub default: BucketConfig,
    pub classes: HashMap<String, BucketConfig>,
}

impl RateLimiterConfig {
    pub fn for_class(&self, endpoint_class: &str) -> BucketConfig {
        self.classes
            .get(endpoint_class)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Outcome of [`RateLimiter::try_consume`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed {
        /// Whole tokens left after this request
        remaining: u64,
    },
    Throttled {
        /// Time until `cost` tokens are available
        retry_after: Duration,
        remaining: u64,
        /// Time until the bucket is full again
        reset_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill_at: Instant,
}

impl Bucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.refill_per_sec).min(self.config.capacity);
        self.last_refill_at = now;
    }

    fn time_to(&self, tokens: f64) -> Duration {
        let missing = (tokens - self.tokens).max(0.0);
        if missing == 0.0 {
            return Duration::ZERO;
        }
        if !(self.config.refill_per_sec > 0.0) {
            return Duration::MAX;
        }
        // Saturate when the wait does not fit in a Duration
        Duration::try_from_secs_f64(missing / self.config.refill_per_sec).unwrap_or(Duration::MAX)
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.config.capacity
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LimiterStats {
    pub buckets: usize,
    pub allowed: u64,
    pub throttled: u64,
}

/// Token buckets keyed by `(tenant_id, endpoint_class)`
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<(String, String), Bucket>,
    allowed: AtomicU64,
    throttled: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            allowed: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Refill, then take `cost` tokens if there are enough
    pub fn try_consume(&self, tenant_id: &str, endpoint_class: &str, cost: f64) -> Decision {
        let now = Instant::now();
        let key = (tenant_id.to_string(), endpoint_class.to_string());
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(self.config.for_class(endpoint_class), now));

        bucket.refill(now);

        if !cost.is_finite() || cost < 0.0 {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            warn!(
                tenant = tenant_id,
                class = endpoint_class,
                cost = cost,
                "Rejected rate-limit cost"
            );
            return Decision::Throttled {
                retry_after: Duration::MAX,
                remaining: bucket.tokens.floor() as u64,
                reset_after: bucket.time_to(bucket.config.capacity),
            };
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return Decision::Allowed {
                remaining: bucket.tokens.floor() as u64,
            };
        }

        self.throttled.fetch_add(1, Ordering::Relaxed);
        debug!(
            tenant = tenant_id,
            class = endpoint_class,
            tokens = bucket.tokens,
            "Request throttled"
        );
        Decision::Throttled {
            retry_after: bucket.time_to(cost),
            remaining: bucket.tokens.floor() as u64,
            reset_after: bucket.time_to(bucket.config.capacity),
        }
    }

    /// Current token count for a bucket, refilled to now. `None` if the bucket
    /// was never used.
    pub fn tokens(&self, tenant_id: &str, endpoint_class: &str) -> Option<f64> {
        let key = (tenant_id.to_string(), endpoint_class.to_string());
        let mut bucket = self.buckets.get_mut(&key)?;
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    /// Drop buckets that are full and untouched for `max_age`; a fresh bucket
    /// would behave identically
    pub fn cleanup_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill_at) >= max_age;
            bucket.refill(now);
            !(idle && bucket.is_full())
        });
        before - self.buckets.len()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            buckets: self.buckets.len(),
            allowed: self.allowed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            default: BucketConfig {
                capacity,
                refill_per_sec,
            },
            classes: HashMap::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle_then_refill() {
        let limiter = limiter(100.0, 2.0);

        for _ in 0..100 {
            assert!(limiter.try_consume("acme", "odds", 1.0).is_allowed());
        }
        match limiter.try_consume("acme", "odds", 1.0) {
            Decision::Throttled { retry_after, remaining, .. } => {
                assert_eq!(remaining, 0);
                assert_eq!(retry_after, Duration::from_millis(500));
            }
            other => panic!("expected throttle, got {:?}", other),
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_consume("acme", "odds", 1.0).is_allowed());
        assert!(!limiter.try_consume("acme", "odds", 1.0).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let limiter = limiter(10.0, 5.0);
        limiter.try_consume("acme", "odds", 4.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.tokens("acme", "odds"), Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenants_and_classes_are_isolated() {
        let limiter = limiter(1.0, 0.0);
        assert!(limiter.try_consume("acme", "odds", 1.0).is_allowed());
        assert!(!limiter.try_consume("acme", "odds", 1.0).is_allowed());
        assert!(limiter.try_consume("globex", "odds", 1.0).is_allowed());
        assert!(limiter.try_consume("acme", "profile", 1.0).is_allowed());
        assert_eq!(limiter.stats().buckets, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_class_config() {
        let mut classes = HashMap::new();
        classes.insert(
            "bets".to_string(),
            BucketConfig {
                capacity: 2.0,
                refill_per_sec: 1.0,
            },
        );
        let limiter = RateLimiter::new(RateLimiterConfig {
            default: BucketConfig::default(),
            classes,
        });

        assert!(limiter.try_consume("acme", "bets", 1.0).is_allowed());
        assert!(limiter.try_consume("acme", "bets", 1.0).is_allowed());
        match limiter.try_consume("acme", "bets", 1.0) {
            Decision::Throttled { reset_after, .. } => {
                assert_eq!(reset_after, Duration::from_secs(2));
            }
            other => panic!("expected throttle, got {:?}", other),
        }
        assert!(limiter.try_consume("acme", "odds", 1.0).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_idle_keeps_partial_buckets() {
        let limiter = limiter(10.0, 1.0);
        limiter.try_consume("full", "odds", 1.0);
        limiter.try_consume("drained", "odds", 10.0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.cleanup_idle(Duration::from_secs(1)), 1);
        assert!(limiter.tokens("full", "odds").is_none());
        assert!(limiter.tokens("drained", "odds").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_saturates_retry_after() {
        let limiter = limiter(1.0, 1e-20);
        assert!(limiter.try_consume("acme", "odds", 1.0).is_allowed());

        match limiter.try_consume("acme", "odds", 1.0) {
            Decision::Throttled {
                retry_after,
                reset_after,
                ..
            } => {
                assert_eq!(retry_after, Duration::MAX);
                assert_eq!(reset_after, Duration::MAX);
            }
            other => panic!("expected throttle, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_cost_never_mints_tokens() {
        let limiter = limiter(10.0, 0.0);
        assert!(limiter.try_consume("acme", "odds", 10.0).is_allowed());

        for cost in [-1000.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(!limiter.try_consume("acme", "odds", cost).is_allowed());
        }
        assert_eq!(limiter.tokens("acme", "odds"), Some(0.0));
        assert!(!limiter.try_consume("acme", "odds", 1.0).is_allowed());
        assert_eq!(limiter.stats().throttled, 5);
    }
}

//! Liveness and status reporting
//!
//! The liveness probe answers without touching the pool, cache or limiter, so
//! it stays green while the database is saturated or down. The status report
//! is the detailed view operators use to spot saturation and leaks.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{CacheStats, TenantCache};
use crate::limiter::{LimiterStats, RateLimiter};
use crate::pool::{Accountant, CircuitBreaker, CircuitStats, OwnerTagActive, TrackingReport};

/// Number of owner tags listed in the status report
pub const TOP_OWNER_TAGS: usize = 10;

/// Liveness probe body
pub fn liveness() -> &'static str {
    "ok"
}

/// Detailed status of the pool and its guards
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub pool_size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiting_count: usize,
    pub max_size: usize,
    pub breaker_state: &'static str,
    pub tracking: TrackingReport,
    pub top_owner_tags_by_active: Vec<OwnerTagActive>,
    pub breaker: CircuitStats,
    pub cache: CacheStats,
    pub limiter: LimiterStats,
}

impl StatusReport {
    pub fn collect(
        accountant: &Accountant,
        breaker: &CircuitBreaker,
        cache: &TenantCache,
        limiter: &RateLimiter,
    ) -> Self {
        let metrics = accountant.pool().metrics();
        let breaker_stats = breaker.stats();
        Self {
            generated_at: Utc::now(),
            pool_size: metrics.pool_size,
            idle: metrics.idle,
            checked_out: metrics.checked_out,
            waiting_count: metrics.waiting_count,
            max_size: metrics.max_size,
            breaker_state: breaker_stats.state,
            tracking: accountant.tracking(),
            top_owner_tags_by_active: accountant.ledger().top_owner_tags_by_active(TOP_OWNER_TAGS),
            breaker: breaker_stats,
            cache: cache.stats(),
            limiter: limiter.stats(),
        }
    }

    /// Leaks or untracked checkouts are worth an operator's attention
    pub fn is_degraded(&self) -> bool {
        self.tracking.discrepancy != 0 || self.breaker_state != "Closed"
    }
}

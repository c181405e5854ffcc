use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::limiter::{BucketConfig, RateLimiterConfig};
use crate::pool::{CircuitBreakerConfig, PoolConfig};

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:8080)
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Connection pool configuration. Durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Pool role; one pool per role per process
    pub role: String,

    pub min_size: usize,

    pub max_size: usize,

    pub acquire_timeout_ms: u64,

    pub connect_timeout_ms: u64,

    /// Idle sessions older than this are closed down to `min_size`
    pub max_idle_ms: u64,

    /// Sessions older than this are closed on return or by the reaper
    pub max_lifetime_ms: u64,

    pub reap_interval_ms: u64,

    /// Idle sessions older than this are pinged before reuse
    pub health_check_after_ms: u64,

    /// Checkouts held longer than this are reclaimed as leaked (None disables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim_after_ms: Option<u64>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for PoolSection {
    fn from(c: &PoolConfig) -> Self {
        Self {
            role: c.role.clone(),
            min_size: c.min_size,
            max_size: c.max_size,
            acquire_timeout_ms: millis(c.acquire_timeout),
            connect_timeout_ms: millis(c.connect_timeout),
            max_idle_ms: millis(c.max_idle_duration),
            max_lifetime_ms: millis(c.max_lifetime),
            reap_interval_ms: millis(c.reap_interval),
            health_check_after_ms: millis(c.health_check_after),
            reclaim_after_ms: c.reclaim_after.map(millis),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            role: self.role.clone(),
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_idle_duration: Duration::from_millis(self.max_idle_ms),
            max_lifetime: Duration::from_millis(self.max_lifetime_ms),
            reap_interval: Duration::from_millis(self.reap_interval_ms),
            health_check_after: Duration::from_millis(self.health_check_after_ms),
            reclaim_after: self.reclaim_after_ms.map(Duration::from_millis),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    /// Open at this `checked_out / max_size` ratio
    pub open_utilization_threshold: f64,

    /// Open at this many waiting acquirers
    pub open_waiting_threshold: usize,

    pub cooldown_ms: u64,

    pub tick_ms: u64,

    /// Acquire timeout for critical writes while the circuit is not closed
    pub critical_write_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let c = CircuitBreakerConfig::default();
        Self {
            open_utilization_threshold: c.open_utilization_threshold,
            open_waiting_threshold: c.open_waiting_threshold,
            cooldown_ms: millis(c.cooldown_duration),
            tick_ms: millis(c.tick_interval),
            critical_write_timeout_ms: millis(c.critical_write_timeout),
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            open_utilization_threshold: self.open_utilization_threshold,
            open_waiting_threshold: self.open_waiting_threshold,
            cooldown_duration: Duration::from_millis(self.cooldown_ms),
            tick_interval: Duration::from_millis(self.tick_ms),
            critical_write_timeout: Duration::from_millis(self.critical_write_timeout_ms),
        }
    }
}

/// Tenant cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_ms: u64,

    pub stale_while_revalidate_ms: u64,

    pub refresh_acquire_timeout_ms: u64,

    pub failure_backoff_ms: u64,

    /// Static payload served per resource kind before a tenant is fetched
    pub defaults: HashMap<String, serde_json::Value>,
}

impl Default for CacheSection {
    fn default() -> Self {
        let c = CacheConfig::default();
        Self {
            ttl_ms: millis(c.ttl),
            stale_while_revalidate_ms: millis(c.stale_while_revalidate),
            refresh_acquire_timeout_ms: millis(c.refresh_acquire_timeout),
            failure_backoff_ms: millis(c.failure_backoff),
            defaults: c.defaults,
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            stale_while_revalidate: Duration::from_millis(self.stale_while_revalidate_ms),
            refresh_acquire_timeout: Duration::from_millis(self.refresh_acquire_timeout_ms),
            failure_backoff: Duration::from_millis(self.failure_backoff_ms),
            defaults: self.defaults.clone(),
        }
    }
}

/// Rate limits per endpoint class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Bucket used by classes not listed in `classes`
    pub default: BucketConfig,

    pub classes: HashMap<String, BucketConfig>,
}

impl RateLimitSection {
    pub fn to_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            default: self.default,
            classes: self.classes.clone(),
        }
    }
}

/// Background maintenance intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    /// How often the tracking discrepancy is sampled
    pub tracking_interval_ms: u64,

    /// How often idle, full rate-limit buckets are dropped
    pub limiter_cleanup_interval_ms: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            tracking_interval_ms: 10_000,
            limiter_cleanup_interval_ms: 60_000,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub rate_limits: RateLimitSection,

    #[serde(default)]
    pub maintenance: MaintenanceSection,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject configurations the process cannot run with
    pub fn validate(&self) -> Result<()> {
        self.pool
            .to_pool_config()
            .validate()
            .context("Invalid pool configuration")?;

        let threshold = self.breaker.open_utilization_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!(
                "breaker.open_utilization_threshold must be in (0, 1], got {}",
                threshold
            );
        }
        if self.breaker.open_waiting_threshold == 0 {
            anyhow::bail!("breaker.open_waiting_threshold must be at least 1");
        }
        if self.breaker.tick_ms == 0 {
            anyhow::bail!("breaker.tick_ms must be positive");
        }
        if self.cache.ttl_ms == 0 {
            anyhow::bail!("cache.ttl_ms must be positive");
        }

        let buckets = std::iter::once(("default", &self.rate_limits.default)).chain(
            self.rate_limits
                .classes
                .iter()
                .map(|(name, bucket)| (name.as_str(), bucket)),
        );
        for (name, bucket) in buckets {
            if !(bucket.capacity >= 1.0) || !bucket.capacity.is_finite() {
                anyhow::bail!("rate limit '{}': capacity must be a finite number of at least 1", name);
            }
            if !(bucket.refill_per_sec >= 0.0) || !bucket.refill_per_sec.is_finite() {
                anyhow::bail!("rate limit '{}': refill_per_sec must be finite and not negative", name);
            }
        }

        if self.maintenance.tracking_interval_ms == 0
            || self.maintenance.limiter_cleanup_interval_ms == 0
        {
            anyhow::bail!("maintenance intervals must be positive");
        }

        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Parse an optional environment variable. Set but unparsable is an error.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", name, raw, e)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).context(format!("Failed to read {}", name)),
    }
}

/// Load configuration from environment variables
///
/// Every variable is optional and overrides the built-in default:
/// - POOLGUARD_LISTEN
/// - POOLGUARD_POOL_MIN / POOLGUARD_POOL_MAX
/// - POOLGUARD_ACQUIRE_TIMEOUT_MS
/// - POOLGUARD_MAX_IDLE_MS / POOLGUARD_MAX_LIFETIME_MS
/// - POOLGUARD_BREAKER_UTILIZATION / POOLGUARD_BREAKER_WAITING
/// - POOLGUARD_BREAKER_COOLDOWN_MS
/// - POOLGUARD_CACHE_TTL_MS
/// - POOLGUARD_RATE_CAPACITY / POOLGUARD_RATE_REFILL (default endpoint class)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Some(listen) = env_parse::<String>("POOLGUARD_LISTEN")? {
        config.server.listen = listen;
    }

    if let Some(v) = env_parse("POOLGUARD_POOL_MIN")? {
        config.pool.min_size = v;
    }
    if let Some(v) = env_parse("POOLGUARD_POOL_MAX")? {
        config.pool.max_size = v;
    }
    if let Some(v) = env_parse("POOLGUARD_ACQUIRE_TIMEOUT_MS")? {
        config.pool.acquire_timeout_ms = v;
    }
    if let Some(v) = env_parse("POOLGUARD_MAX_IDLE_MS")? {
        config.pool.max_idle_ms = v;
    }
    if let Some(v) = env_parse("POOLGUARD_MAX_LIFETIME_MS")? {
        config.pool.max_lifetime_ms = v;
    }
    if let Some(v) = env_parse("POOLGUARD_HEALTH_CHECK_AFTER_MS")? {
        config.pool.health_check_after_ms = v;
    }

    if let Some(v) = env_parse("POOLGUARD_BREAKER_UTILIZATION")? {
        config.breaker.open_utilization_threshold = v;
    }
    if let Some(v) = env_parse("POOLGUARD_BREAKER_WAITING")? {
        config.breaker.open_waiting_threshold = v;
    }
    if let Some(v) = env_parse("POOLGUARD_BREAKER_COOLDOWN_MS")? {
        config.breaker.cooldown_ms = v;
    }

    if let Some(v) = env_parse("POOLGUARD_CACHE_TTL_MS")? {
        config.cache.ttl_ms = v;
    }

    if let Some(v) = env_parse("POOLGUARD_RATE_CAPACITY")? {
        config.rate_limits.default.capacity = v;
    }
    if let Some(v) = env_parse("POOLGUARD_RATE_REFILL")? {
        config.rate_limits.default.refill_per_sec = v;
    }

    Ok(config)
}

/// Load configuration from file or environment, then validate it
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file; environment variables
///   are used when absent
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate()?;
    Ok(config)
}

//! Per-tenant cache with coalesced background refresh
//!
//! Reads never wait on the database and never fail:
//! - a fresh entry is returned as is
//! - a stale entry is returned immediately while one background refresh runs
//! - a tenant never fetched before gets the static default for the resource kind
//!
//! "Is a refresh running" is a single check on the entry itself: the entry
//! holds the receiving side of the in-flight refresh, so concurrent readers of
//! the same key join it instead of starting their own.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::db::memory::SELECT_RESOURCE;
use crate::db::{DbError, DbSession};
use crate::pool::{Accountant, CircuitBreaker, PoolError};

/// Cache key: one resource kind of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceKey {
    pub tenant_id: String,
    pub kind: String,
}

impl ResourceKey {
    pub fn new(tenant_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.kind)
    }
}

/// A versioned, tenant-scoped snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub body: serde_json::Value,
    pub version: u64,
}

/// How a read was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    Default,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Default => "default",
        }
    }
}

/// Result of a cache read
#[derive(Debug, Clone)]
pub struct CachedResource {
    pub payload: Arc<Payload>,
    pub freshness: Freshness,
    /// Time since the payload was fetched; `None` for defaults
    pub age: Option<Duration>,
}

/// Loads a tenant resource from the database
#[async_trait]
pub trait TenantLoader: Send + Sync + 'static {
    /// `Ok(None)` means the tenant has no stored resource of this kind
    async fn load(
        &self,
        session: &mut dyn DbSession,
        key: &ResourceKey,
    ) -> Result<Option<Payload>, DbError>;
}

/// Loader running one statement with `[tenant_id, kind]` and reading the
/// `payload` and `version` columns of the first row
pub struct StatementLoader {
    statement: String,
}

impl StatementLoader {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
        }
    }
}

impl Default for StatementLoader {
    fn default() -> Self {
        Self::new(SELECT_RESOURCE)
    }
}

#[async_trait]
impl TenantLoader for StatementLoader {
    async fn load(
        &self,
        session: &mut dyn DbSession,
        key: &ResourceKey,
    ) -> Result<Option<Payload>, DbError> {
        let rows = session
            .query(&self.statement, &[&key.tenant_id, &key.kind])
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let version = row
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| DbError::Query("row has no numeric version".to_string()))?;
        let body = row.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        Ok(Some(Payload { body, version }))
    }
}

/// Configuration for the tenant cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a fetched payload counts as fresh
    pub ttl: Duration,

    /// Window advertised to HTTP clients for serving stale content
    pub stale_while_revalidate: Duration,

    /// Acquire timeout used by background refreshes
    pub refresh_acquire_timeout: Duration,

    /// Minimum delay before retrying a failed refresh of the same key
    pub failure_backoff: Duration,

    /// Static payload per resource kind for tenants never fetched
    pub defaults: HashMap<String, serde_json::Value>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            stale_while_revalidate: Duration::from_secs(300),
            refresh_acquire_timeout: Duration::from_secs(2),
            failure_backoff: Duration::from_secs(1),
            defaults: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub default_hits: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub bypassed_refreshes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Database(#[from] DbError),
}

#[derive(Default)]
struct CacheEntry {
    payload: Option<Arc<Payload>>,
    from_default: bool,
    fetched_at: Option<Instant>,
    retry_not_before: Option<Instant>,
    /// Bumped by every invalidation. A refresh started under an older
    /// generation may have read data the invalidating write replaced.
    generation: u64,
    /// Present while a refresh is running; completes when the entry is updated
    refresh_in_flight: Option<watch::Receiver<u64>>,
}

#[derive(Default)]
struct Counters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    default_hits: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    bypassed_refreshes: AtomicU64,
}

struct CacheInner {
    config: CacheConfig,
    entries: DashMap<ResourceKey, CacheEntry>,
    accountant: Arc<Accountant>,
    breaker: Arc<CircuitBreaker>,
    loader: Arc<dyn TenantLoader>,
    counters: Counters,
}

/// The tenant cache. Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct TenantCache {
    inner: Arc<CacheInner>,
}

impl TenantCache {
    pub fn new(
        config: CacheConfig,
        accountant: Arc<Accountant>,
        breaker: Arc<CircuitBreaker>,
        loader: Arc<dyn TenantLoader>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: DashMap::new(),
                accountant,
                breaker,
                loader,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Serve `key` without waiting on the database.
    ///
    /// Starts one background refresh when the entry is stale or absent, no
    /// refresh is running, and the circuit breaker allows database reads.
    pub fn get(&self, key: &ResourceKey) -> CachedResource {
        let now = Instant::now();
        let mut entry = self.inner.entries.entry(key.clone()).or_default();

        if let Some(resource) = self.inner.fresh(&entry, now) {
            return resource;
        }

        self.inner.ensure_refresh(key, &mut entry, now);
        let resource = self.inner.stale_or_default(&entry, key, now);
        self.inner.count_hit(resource.freshness);
        resource
    }

    /// Like [`TenantCache::get`], but when the entry is not fresh wait up to
    /// `max_wait` for the in-flight refresh before answering
    pub async fn get_fresh(&self, key: &ResourceKey, max_wait: Duration) -> CachedResource {
        let waiter = {
            let now = Instant::now();
            let mut entry = self.inner.entries.entry(key.clone()).or_default();
            if let Some(resource) = self.inner.fresh(&entry, now) {
                return resource;
            }
            self.inner.ensure_refresh(key, &mut entry, now);
            entry.refresh_in_flight.clone()
        };

        if let Some(mut rx) = waiter {
            if tokio::time::timeout(max_wait, rx.changed()).await.is_err() {
                debug!(key = %key, "Gave up waiting for refresh");
            }
        }

        let now = Instant::now();
        let resource = match self.inner.entries.get(key) {
            Some(entry) => match self.inner.fresh(&entry, now) {
                Some(resource) => return resource,
                None => self.inner.stale_or_default(&entry, key, now),
            },
            None => self.inner.default_for(key),
        };
        self.inner.count_hit(resource.freshness);
        resource
    }

    /// Current entry without triggering a refresh. `None` if never fetched.
    pub fn peek(&self, key: &ResourceKey) -> Option<CachedResource> {
        let entry = self.inner.entries.get(key)?;
        entry.payload.as_ref()?;
        let now = Instant::now();
        Some(
            self.inner
                .fresh(&entry, now)
                .unwrap_or_else(|| self.inner.stale_or_default(&entry, key, now)),
        )
    }

    /// Mark an entry stale so the next read refreshes it
    pub fn invalidate(&self, key: &ResourceKey) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.generation += 1;
            entry.fetched_at = None;
            entry.retry_not_before = None;
        }
    }

    /// Whether a refresh for `key` is running
    pub fn refresh_in_flight(&self, key: &ResourceKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.refresh_in_flight.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            entries: self.inner.entries.len(),
            fresh_hits: c.fresh_hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            default_hits: c.default_hits.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
            refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
            bypassed_refreshes: c.bypassed_refreshes.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    fn fresh(&self, entry: &CacheEntry, now: Instant) -> Option<CachedResource> {
        let payload = entry.payload.as_ref()?;
        let fetched_at = entry.fetched_at?;
        let age = now.duration_since(fetched_at);
        if age >= self.config.ttl {
            return None;
        }
        let freshness = if entry.from_default {
            Freshness::Default
        } else {
            Freshness::Fresh
        };
        self.count_hit(freshness);
        Some(CachedResource {
            payload: Arc::clone(payload),
            freshness,
            age: Some(age),
        })
    }

    fn stale_or_default(&self, entry: &CacheEntry, key: &ResourceKey, now: Instant) -> CachedResource {
        match &entry.payload {
            Some(payload) if !entry.from_default => CachedResource {
                payload: Arc::clone(payload),
                freshness: Freshness::Stale,
                age: entry.fetched_at.map(|at| now.duration_since(at)),
            },
            Some(payload) => CachedResource {
                payload: Arc::clone(payload),
                freshness: Freshness::Default,
                age: None,
            },
            None => self.default_for(key),
        }
    }

    fn default_for(&self, key: &ResourceKey) -> CachedResource {
        let body = self
            .config
            .defaults
            .get(&key.kind)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        CachedResource {
            payload: Arc::new(Payload { body, version: 0 }),
            freshness: Freshness::Default,
            age: None,
        }
    }

    fn count_hit(&self, freshness: Freshness) {
        let counter = match freshness {
            Freshness::Fresh => &self.counters.fresh_hits,
            Freshness::Stale => &self.counters.stale_hits,
            Freshness::Default => &self.counters.default_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a refresh for a non-fresh entry unless one is running, the last
    /// one failed recently, or the breaker keeps reads off the database
    fn ensure_refresh(self: &Arc<Self>, key: &ResourceKey, entry: &mut CacheEntry, now: Instant) {
        if entry.refresh_in_flight.is_some() {
            return;
        }
        if entry.retry_not_before.is_some_and(|at| now < at) {
            return;
        }
        if self.breaker.should_bypass_db_for_reads() {
            self.counters.bypassed_refreshes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (tx, rx) = watch::channel(0u64);
        entry.refresh_in_flight = Some(rx);

        let inner = Arc::clone(self);
        let key = key.clone();
        let generation = entry.generation;
        handle.spawn(async move {
            inner.refresh(key, generation, tx).await;
        });
    }

    async fn refresh(&self, key: ResourceKey, generation: u64, done: watch::Sender<u64>) {
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        let result = self.fetch(&key).await;
        let now = Instant::now();

        let version = {
            let mut entry = self.entries.entry(key.clone()).or_default();
            entry.refresh_in_flight = None;
            let invalidated = entry.generation != generation;
            match result {
                Ok(Some(payload)) if invalidated => {
                    // The read may predate the write; keep the entry stale so
                    // the next read fetches again, and never go backwards
                    let version = payload.version;
                    let newer_cached = !entry.from_default
                        && entry.payload.as_ref().is_some_and(|cached| cached.version > version);
                    if !newer_cached {
                        entry.payload = Some(Arc::new(payload));
                        entry.from_default = false;
                    }
                    debug!(key = %key, version = version, "Refresh raced an invalidation, entry left stale");
                    Some(version)
                }
                Ok(None) if invalidated => Some(0),
                Ok(Some(payload)) => {
                    // Payloads are whole snapshots: the refresh finishing last wins
                    let version = payload.version;
                    entry.payload = Some(Arc::new(payload));
                    entry.from_default = false;
                    entry.fetched_at = Some(now);
                    entry.retry_not_before = None;
                    Some(version)
                }
                Ok(None) => {
                    let default = self.default_for(&key);
                    entry.payload = Some(default.payload);
                    entry.from_default = true;
                    entry.fetched_at = Some(now);
                    entry.retry_not_before = None;
                    Some(0)
                }
                Err(e) => {
                    self.counters.refresh_failures.fetch_add(1, Ordering::Relaxed);
                    entry.retry_not_before = Some(now + self.config.failure_backoff);
                    warn!(key = %key, error = %e, "cache_refresh_failed");
                    None
                }
            }
        };

        if let Some(version) = version {
            debug!(key = %key, version = version, "Cache entry refreshed");
            let _ = done.send(version);
        }
        // On failure the sender is dropped, which wakes every waiter as well
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<Option<Payload>, RefreshError> {
        let permit = self.breaker.begin_operation();
        let owner_tag = format!("cache_refresh:{}", key.kind);

        let mut conn = match self
            .accountant
            .acquire(&owner_tag, self.config.refresh_acquire_timeout)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                permit.failed();
                return Err(e.into());
            }
        };

        let result = match conn.session().await {
            Ok(mut session) => self.loader.load(&mut *session, key).await,
            Err(e) => Err(e),
        };
        if matches!(result, Err(DbError::Unreachable(_))) {
            conn.mark_broken();
        }
        conn.release().await;

        match result {
            Ok(payload) => {
                permit.succeeded();
                Ok(payload)
            }
            Err(e) => {
                permit.failed();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::pool::{CircuitBreakerConfig, ConnectionPool, Ledger, PoolConfig};

    struct Fixture {
        cache: TenantCache,
        db: MemoryDatabase,
    }

    /// Reads like [`StatementLoader`], then holds the connection a while
    struct SlowLoader {
        delay: Duration,
    }

    #[async_trait]
    impl TenantLoader for SlowLoader {
        async fn load(
            &self,
            session: &mut dyn DbSession,
            key: &ResourceKey,
        ) -> Result<Option<Payload>, DbError> {
            let payload = StatementLoader::default().load(session, key).await?;
            tokio::time::sleep(self.delay).await;
            Ok(payload)
        }
    }

    fn fixture(role: &str, ttl: Duration) -> Fixture {
        fixture_with_loader(role, ttl, Arc::new(StatementLoader::default()))
    }

    fn fixture_with_loader(role: &str, ttl: Duration, loader: Arc<dyn TenantLoader>) -> Fixture {
        let db = MemoryDatabase::new();
        let pool = Arc::new(
            ConnectionPool::new(
                PoolConfig {
                    role: role.to_string(),
                    min_size: 0,
                    max_size: 4,
                    reap_interval: Duration::from_secs(3600),
                    ..Default::default()
                },
                Arc::new(db.clone()),
                Arc::new(Ledger::new()),
            )
            .unwrap(),
        );
        let accountant = Arc::new(Accountant::new(Arc::clone(&pool)));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default(), pool));
        let mut defaults = HashMap::new();
        defaults.insert("odds".to_string(), serde_json::json!({"markets": []}));
        let cache = TenantCache::new(
            CacheConfig {
                ttl,
                defaults,
                ..Default::default()
            },
            accountant,
            breaker,
            loader,
        );
        Fixture { cache, db }
    }

    #[tokio::test]
    async fn test_absent_entry_serves_default_and_refreshes() {
        let f = fixture("cache-absent", Duration::from_secs(30));
        f.db.put_resource("acme", "odds", serde_json::json!({"markets": [1]}));
        let key = ResourceKey::new("acme", "odds");

        let first = f.cache.get(&key);
        assert_eq!(first.freshness, Freshness::Default);
        assert_eq!(first.payload.body, serde_json::json!({"markets": []}));

        let fresh = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(fresh.freshness, Freshness::Fresh);
        assert_eq!(fresh.payload.version, 1);
        assert_eq!(f.cache.stats().refreshes, 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_gets_default() {
        let f = fixture("cache-unknown", Duration::from_secs(30));
        let key = ResourceKey::new("brand-new", "profile");

        let resource = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(resource.freshness, Freshness::Default);
        assert_eq!(resource.payload.body, serde_json::json!({}));
        assert_eq!(resource.payload.version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_served_while_revalidating() {
        let f = fixture("cache-stale", Duration::from_secs(10));
        f.db.put_resource("acme", "odds", serde_json::json!({"v": 1}));
        let key = ResourceKey::new("acme", "odds");
        f.cache.get_fresh(&key, Duration::from_secs(1)).await;

        f.db.put_resource("acme", "odds", serde_json::json!({"v": 2}));
        tokio::time::advance(Duration::from_secs(11)).await;

        let stale = f.cache.get(&key);
        assert_eq!(stale.freshness, Freshness::Stale);
        assert_eq!(stale.payload.version, 1);
        assert!(f.cache.refresh_in_flight(&key));

        let fresh = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(fresh.payload.version, 2);
        assert_eq!(f.cache.stats().refreshes, 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_payload() {
        let f = fixture("cache-failed", Duration::from_millis(1));
        f.db.put_resource("acme", "odds", serde_json::json!({"v": 1}));
        let key = ResourceKey::new("acme", "odds");
        f.cache.get_fresh(&key, Duration::from_secs(1)).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        f.db.fail_next_queries(1);

        let resource = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(resource.freshness, Freshness::Stale);
        assert_eq!(resource.payload.version, 1);
        assert_eq!(f.cache.stats().refresh_failures, 1);
        assert!(!f.cache.refresh_in_flight(&key));
    }

    #[tokio::test]
    async fn test_peek_does_not_refresh() {
        let f = fixture("cache-peek", Duration::from_secs(30));
        let key = ResourceKey::new("acme", "odds");
        assert!(f.cache.peek(&key).is_none());
        assert_eq!(f.cache.stats().refreshes, 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let f = fixture("cache-invalidate", Duration::from_secs(30));
        f.db.put_resource("acme", "odds", serde_json::json!({"v": 1}));
        let key = ResourceKey::new("acme", "odds");
        f.cache.get_fresh(&key, Duration::from_secs(1)).await;

        f.db.put_resource("acme", "odds", serde_json::json!({"v": 2}));
        f.cache.invalidate(&key);

        let resource = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(resource.payload.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_refresh_is_not_lost() {
        let f = fixture_with_loader(
            "cache-invalidate-race",
            Duration::from_secs(30),
            Arc::new(SlowLoader {
                delay: Duration::from_millis(200),
            }),
        );
        f.db.put_resource("acme", "odds", serde_json::json!({"v": 1}));
        let key = ResourceKey::new("acme", "odds");

        // The refresh reads v1, then the write lands while it is still running
        f.cache.get(&key);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.cache.refresh_in_flight(&key));
        f.db.put_resource("acme", "odds", serde_json::json!({"v": 2}));
        f.cache.invalidate(&key);

        let landed = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(landed.freshness, Freshness::Stale);
        assert_eq!(landed.payload.version, 1);

        let fresh = f.cache.get_fresh(&key, Duration::from_secs(1)).await;
        assert_eq!(fresh.freshness, Freshness::Fresh);
        assert_eq!(fresh.payload.version, 2);
        assert_eq!(f.cache.stats().refreshes, 2);
    }
}

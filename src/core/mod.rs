use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CachedResource, ResourceKey, StatementLoader, TenantCache, TenantLoader};
use crate::config::Config;
use crate::db::memory::UPSERT_RESOURCE;
use crate::db::{ConnectionManager, DbError, DbSession};
use crate::health::StatusReport;
use crate::limiter::{Decision, RateLimiter};
use crate::pool::{
    AcquireObserver, Accountant, CircuitBreaker, ConnectionPool, Ledger, PoolError, PooledConnection,
};
use crate::worker::{run_with_retry, RetryPolicy, WorkerError};

/// Errors surfaced to request handlers
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Throttled and nothing cached to fall back on
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        reset_after: Duration,
    },

    #[error("Timed out after {waited:?} waiting for a database connection")]
    PoolTimeout { waited: Duration },

    #[error(transparent)]
    Pool(PoolError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<PoolError> for CoreError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Timeout { waited, .. } => CoreError::PoolTimeout { waited },
            other => CoreError::Pool(other),
        }
    }
}

/// Rate-limit state attached to a read that was throttled but served from cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleInfo {
    pub remaining: u64,
    pub reset_after: Duration,
}

/// A served read
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub resource: CachedResource,
    pub throttled: Option<ThrottleInfo>,
}

/// Core shared by the server, the simulator and background tasks
///
/// Every component is built once at startup and shared through `Arc`s; there
/// is exactly one pool per process role.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool>,
    pub accountant: Arc<Accountant>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub cache: TenantCache,
    pub limiter: Arc<RateLimiter>,
}

impl Core {
    pub fn new(config: Config, manager: Arc<dyn ConnectionManager>) -> Result<Self> {
        Self::with_loader(config, manager, Arc::new(StatementLoader::default()))
    }

    pub fn with_loader(
        config: Config,
        manager: Arc<dyn ConnectionManager>,
        loader: Arc<dyn TenantLoader>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let ledger = Arc::new(Ledger::new());
        let pool = Arc::new(
            ConnectionPool::new(config.pool.to_pool_config(), manager, ledger)
                .context("Failed to create connection pool")?,
        );
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            config.breaker.to_breaker_config(),
            Arc::clone(&pool),
        ));
        let accountant = Arc::new(Accountant::with_observer(
            Arc::clone(&pool),
            Arc::clone(&circuit_breaker) as Arc<dyn AcquireObserver>,
        ));
        let cache = TenantCache::new(
            config.cache.to_cache_config(),
            Arc::clone(&accountant),
            Arc::clone(&circuit_breaker),
            loader,
        );
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.to_limiter_config()));

        Ok(Self {
            config,
            pool,
            accountant,
            circuit_breaker,
            cache,
            limiter,
        })
    }

    /// Start the breaker ticker, the tracking monitor and limiter cleanup.
    /// Call this for long-running modes; the pool reaper runs on its own.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let maintenance = &self.config.maintenance;
        let tracking_interval = Duration::from_millis(maintenance.tracking_interval_ms);
        let cleanup_interval = Duration::from_millis(maintenance.limiter_cleanup_interval_ms);

        let limiter = Arc::clone(&self.limiter);
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup_idle(cleanup_interval);
                if removed > 0 {
                    tracing::debug!(removed = removed, "Dropped idle rate-limit buckets");
                }
            }
        });

        vec![
            Arc::clone(&self.circuit_breaker).spawn_ticker(),
            Arc::clone(&self.accountant).spawn_monitor(tracking_interval),
            cleanup,
        ]
    }

    /// Open `min_size` sessions ahead of traffic
    pub async fn warm_up(&self) -> Result<usize> {
        let opened = self
            .pool
            .warm_up()
            .await
            .context("Failed to warm up connection pool")?;
        info!(opened = opened, "pool_warmed");
        Ok(opened)
    }

    /// Non-critical read: limiter, then cache. Never waits on the database.
    ///
    /// A throttled request is still served when the cache holds an entry for
    /// the key; it only fails when there is nothing to fall back on.
    pub fn read_tenant_resource(
        &self,
        tenant_id: &str,
        kind: &str,
        endpoint_class: &str,
    ) -> Result<ReadOutcome, CoreError> {
        let key = ResourceKey::new(tenant_id, kind);

        match self.limiter.try_consume(tenant_id, endpoint_class, 1.0) {
            Decision::Allowed { .. } => Ok(ReadOutcome {
                resource: self.cache.get(&key),
                throttled: None,
            }),
            Decision::Throttled {
                retry_after,
                remaining,
                reset_after,
            } => match self.cache.peek(&key) {
                Some(resource) => Ok(ReadOutcome {
                    resource,
                    throttled: Some(ThrottleInfo {
                        remaining,
                        reset_after,
                    }),
                }),
                None => Err(CoreError::RateLimited {
                    retry_after,
                    reset_after,
                }),
            },
        }
    }

    /// Critical write: stores a new payload inside a transaction and
    /// invalidates the cached entry. Returns the stored version.
    ///
    /// Runs even while the breaker is open, with its shortened acquire
    /// timeout; a timeout is surfaced, never swallowed.
    pub async fn write_tenant_resource(
        &self,
        tenant_id: &str,
        kind: &str,
        endpoint_class: &str,
        payload: &serde_json::Value,
    ) -> Result<u64, CoreError> {
        if let Decision::Throttled {
            retry_after,
            reset_after,
            ..
        } = self.limiter.try_consume(tenant_id, endpoint_class, 1.0)
        {
            return Err(CoreError::RateLimited {
                retry_after,
                reset_after,
            });
        }

        let body = serde_json::to_string(payload)
            .map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
        let timeout = self
            .circuit_breaker
            .write_timeout(self.pool.config().acquire_timeout);
        let permit = self.circuit_breaker.begin_operation();
        let owner_tag = format!("critical_write:{}", kind);

        let mut conn = match self.accountant.acquire(&owner_tag, timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(tenant = tenant_id, kind = kind, error = %e, "critical_write_rejected");
                permit.failed();
                return Err(e.into());
            }
        };

        let result = upsert_in_transaction(&mut conn, tenant_id, kind, &body).await;
        if matches!(result, Err(DbError::Unreachable(_))) {
            conn.mark_broken();
        }
        conn.release().await;

        match result {
            Ok(version) => {
                permit.succeeded();
                self.cache.invalidate(&ResourceKey::new(tenant_id, kind));
                info!(tenant = tenant_id, kind = kind, version = version, "resource_written");
                Ok(version)
            }
            Err(e) => {
                permit.failed();
                warn!(tenant = tenant_id, kind = kind, error = %e, "critical_write_failed");
                Err(e.into())
            }
        }
    }

    /// Background ingestion of a resource, retried with jittered backoff
    pub async fn ingest_resource(
        &self,
        tenant_id: &str,
        kind: &str,
        payload: &serde_json::Value,
        policy: &RetryPolicy,
    ) -> Result<u64, WorkerError> {
        let body = payload.to_string();
        let owner_tag = format!("ingest:{}", kind);
        let version = run_with_retry(&self.accountant, &owner_tag, policy, |session| {
            let tenant_id = tenant_id.to_string();
            let kind = kind.to_string();
            let body = body.clone();
            Box::pin(async move { upsert(session, &tenant_id, &kind, &body).await })
        })
        .await?;
        self.cache.invalidate(&ResourceKey::new(tenant_id, kind));
        Ok(version)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::collect(
            &self.accountant,
            &self.circuit_breaker,
            &self.cache,
            &self.limiter,
        )
    }

    /// Close the pool; idle sessions are dropped and later acquisitions fail
    pub fn shutdown(&self) {
        self.pool.close();
    }
}

async fn upsert(
    session: &mut dyn DbSession,
    tenant_id: &str,
    kind: &str,
    body: &str,
) -> Result<u64, DbError> {
    let rows = session.query(UPSERT_RESOURCE, &[tenant_id, kind, body]).await?;
    rows.first()
        .and_then(|row| row.get("version"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| DbError::Query("upsert returned no version".to_string()))
}

async fn upsert_in_transaction(
    conn: &mut PooledConnection,
    tenant_id: &str,
    kind: &str,
    body: &str,
) -> Result<u64, DbError> {
    let mut session = conn.session().await?;
    session.execute("BEGIN").await?;
    // An error here leaves the transaction open; the pool rolls it back on release
    let version = upsert(&mut *session, tenant_id, kind, body).await?;
    session.execute("COMMIT").await?;
    Ok(version)
}

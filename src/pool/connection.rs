//! Bounded database connection pool
//!
//! This module provides the single shared pool of database sessions:
//! - At most `max_size` connections checked out at any time
//! - Acquisition with a caller-supplied timeout, never an unbounded wait
//! - Scoped checkout through [`PooledConnection`], released exactly once on
//!   every exit path (explicit `release().await` or drop)
//! - Transaction rollback before a session re-enters the idle set
//! - A liveness ping before reusing a session that sat idle for a while
//! - A background reaper retiring idle/old sessions and reclaiming abandoned checkouts

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{MappedMutexGuard, Mutex as SessionMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::accounting::{untracked_tag, Ledger};
use crate::db::{ConnectionManager, DbError, DbSession};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out after {waited:?} waiting for a connection (owner: {owner_tag})")]
    Timeout { owner_tag: String, waited: Duration },

    #[error("Failed to open database connection: {0}")]
    Connect(#[from] DbError),

    #[error("Pool is closed")]
    Closed,

    #[error("A pool for role '{0}' already exists in this process")]
    DuplicatePool(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Process role owning the pool; only one live pool per role is allowed
    pub role: String,

    /// Number of connections kept open during quiet periods
    pub min_size: usize,

    /// Hard upper bound on checked-out connections
    pub max_size: usize,

    /// Default time a caller may wait for a connection
    pub acquire_timeout: Duration,

    /// Time allowed to open a brand new session or roll one back
    pub connect_timeout: Duration,

    /// Idle sessions older than this are retired (down to `min_size`)
    pub max_idle_duration: Duration,

    /// Sessions older than this are never handed out again
    pub max_lifetime: Duration,

    /// How often the reaper runs
    pub reap_interval: Duration,

    /// Idle sessions older than this are pinged before being handed out
    pub health_check_after: Duration,

    /// Checkouts held longer than this are forcibly reclaimed and counted as
    /// leaked. The holder's session is closed; a holder in the middle of an
    /// operation is reclaimed on the first reaper pass after it finishes.
    pub reclaim_after: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            role: "primary".to_string(),
            min_size: 2,
            max_size: 20,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            max_idle_duration: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            reap_interval: Duration::from_secs(30),
            health_check_after: Duration::from_secs(30),
            reclaim_after: Some(Duration::from_secs(600)),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("acquire_timeout must be positive".to_string()));
        }
        if self.reap_interval.is_zero() {
            return Err(PoolError::InvalidConfig("reap_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle state of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Broken,
}

/// Cumulative pool counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Sessions opened
    pub total_created: u64,

    /// Checkouts served from the idle set
    pub total_reused: u64,

    /// Sessions closed for age, idleness, breakage or a failed liveness ping
    pub total_retired: u64,

    /// Acquisitions that gave up waiting
    pub total_timeouts: u64,

    /// Checkouts forcibly reclaimed from their holder
    pub total_reclaimed: u64,
}

/// Point-in-time pool readings. Reading them never waits on the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Live sessions, idle or checked out
    pub pool_size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiting_count: usize,
    pub max_size: usize,
    #[serde(flatten)]
    pub stats: PoolStats,
}

impl PoolMetrics {
    /// Fraction of `max_size` currently checked out
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.checked_out as f64 / self.max_size as f64
    }
}

struct IdleConnection {
    id: u64,
    session: Box<dyn DbSession>,
    created_at: Instant,
    idle_since: Instant,
    use_count: u64,
}

/// Session of a checkout, shared with the pool so the reaper can close it
type SessionSlot = Arc<SessionMutex<Option<Box<dyn DbSession>>>>;

struct CheckoutRecord {
    session: SessionSlot,
    owner_tag: Option<String>,
    call_site: &'static Location<'static>,
    acquired_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    active: HashMap<u64, CheckoutRecord>,
    /// Live sessions: idle, checked out, or on their way back
    total: usize,
    stats: PoolStats,
    closed: bool,
}

/// State shared between the pool handle, its reaper and every checkout
pub(crate) struct PoolShared {
    config: PoolConfig,
    manager: Arc<dyn ConnectionManager>,
    ledger: Arc<Ledger>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    waiting: AtomicUsize,
    next_id: AtomicU64,
}

/// Process-wide set of roles that currently own a pool
fn live_roles() -> &'static Mutex<HashSet<String>> {
    static ROLES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ROLES.get_or_init(|| Mutex::new(HashSet::new()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Counts a caller as waiting until the guard is dropped, including on timeout
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The bounded pool of database sessions
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create the pool for `config.role`.
    ///
    /// Fails if the configuration is invalid or if a pool for the same role is
    /// already alive in this process. When called inside a tokio runtime the
    /// background reaper is started immediately.
    pub fn new(
        config: PoolConfig,
        manager: Arc<dyn ConnectionManager>,
        ledger: Arc<Ledger>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        if !lock(live_roles()).insert(config.role.clone()) {
            return Err(PoolError::DuplicatePool(config.role.clone()));
        }

        info!(
            role = %config.role,
            min_size = config.min_size,
            max_size = config.max_size,
            "Creating connection pool"
        );

        let shared = Arc::new(PoolShared {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            config,
            manager,
            ledger,
            state: Mutex::new(PoolState::default()),
            waiting: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        });

        let pool = Self {
            shared,
            reaper: Mutex::new(None),
        };
        pool.start_reaper();
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.shared.ledger
    }

    /// Check out a connection without an owner tag.
    ///
    /// This is the raw path that bypasses accounting. Connections obtained here
    /// show up as a tracking discrepancy while held and are reported under an
    /// `UNTRACKED:<file>:<line>` tag when they come back.
    #[track_caller]
    pub fn acquire_untracked(
        &self,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<PooledConnection, PoolError>> + '_ {
        let call_site = Location::caller();
        self.shared.checkout(None, call_site, timeout)
    }

    pub(crate) async fn checkout_tagged(
        &self,
        owner_tag: &str,
        call_site: &'static Location<'static>,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        self.shared
            .checkout(Some(owner_tag.to_string()), call_site, timeout)
            .await
    }

    /// Current readings; never waits for a connection
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics()
    }

    /// Owner tags of live checkouts that bypassed accounting
    pub fn untracked_sites(&self) -> Vec<String> {
        let state = lock(&self.shared.state);
        let mut sites: Vec<String> = state
            .active
            .values()
            .filter(|record| record.owner_tag.is_none())
            .map(|record| untracked_tag(record.call_site))
            .collect();
        sites.sort();
        sites.dedup();
        sites
    }

    /// Open connections until `min_size` are live
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let opened = self.shared.replenish().await?;
        info!(role = %self.shared.config.role, opened = opened, "Pool warmed up");
        Ok(opened)
    }

    /// Run one reaper pass immediately
    pub async fn reap_now(&self) {
        self.shared.reap();
        if let Err(e) = self.shared.replenish().await {
            debug!(error = %e, "Replenish after reap failed");
        }
    }

    /// Stop handing out connections and close idle sessions
    pub fn close(&self) {
        let drained = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            let drained: Vec<IdleConnection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            state.stats.total_retired += drained.len() as u64;
            drained
        };
        self.shared.semaphore.close();
        if let Some(handle) = lock(&self.reaper).take() {
            handle.abort();
        }
        info!(
            role = %self.shared.config.role,
            closed_idle = drained.len(),
            "Connection pool closed"
        );
    }

    /// Start the background reaper task, if a runtime is available
    fn start_reaper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(role = %self.shared.config.role, "No runtime, reaper not started");
            return;
        };

        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let interval = self.shared.config.reap_interval;

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if lock(&shared.state).closed {
                    break;
                }
                shared.reap();
                if let Err(e) = shared.replenish().await {
                    debug!(error = %e, "Pool replenish failed");
                }
            }
        });

        *lock(&self.reaper) = Some(task);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reaper).take() {
            handle.abort();
        }
        lock(live_roles()).remove(&self.shared.config.role);
    }
}

impl PoolShared {
    async fn checkout(
        self: &Arc<Self>,
        owner_tag: Option<String>,
        call_site: &'static Location<'static>,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        if lock(&self.state).closed {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let permit = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    lock(&self.state).stats.total_timeouts += 1;
                    let owner = owner_tag.unwrap_or_else(|| untracked_tag(call_site));
                    warn!(
                        owner_tag = %owner,
                        waited_ms = timeout.as_millis() as u64,
                        "pool_timeout"
                    );
                    return Err(PoolError::Timeout {
                        owner_tag: owner,
                        waited: timeout,
                    });
                }
            }
        };

        // Reuse the most recently returned session that is still within its windows
        let mut idle = None;
        loop {
            let (candidate, retired) = {
                let mut state = lock(&self.state);
                let now = Instant::now();
                let mut retired = Vec::new();
                let mut found = None;
                while let Some(conn) = state.idle.pop_back() {
                    if self.is_expired(conn.created_at, conn.idle_since, now) {
                        state.total = state.total.saturating_sub(1);
                        state.stats.total_retired += 1;
                        retired.push(conn);
                        continue;
                    }
                    found = Some(conn);
                    break;
                }
                (found, retired)
            };

            if !retired.is_empty() {
                debug!(retired = retired.len(), "Retired expired idle connections on checkout");
            }
            drop(retired);

            let Some(conn) = candidate else {
                break;
            };
            let budget = timeout
                .saturating_sub(started.elapsed())
                .min(self.config.connect_timeout);
            if let Some(conn) = self.check_idle(conn, budget).await {
                idle = Some(conn);
                break;
            }
        }

        let (id, session, created_at, use_count) = match idle {
            Some(conn) => (conn.id, conn.session, conn.created_at, conn.use_count),
            None => {
                let remaining = timeout.saturating_sub(started.elapsed());
                let budget = remaining.min(self.config.connect_timeout);
                let session = match tokio::time::timeout(budget, self.manager.connect()).await {
                    Ok(Ok(session)) => session,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Failed to open database connection");
                        return Err(PoolError::Connect(e));
                    }
                    Err(_) => return Err(PoolError::Connect(DbError::Timeout)),
                };
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let mut state = lock(&self.state);
                state.total += 1;
                state.stats.total_created += 1;
                debug!(connection_id = id, pool_size = state.total, "Created new connection");
                (id, session, Instant::now(), 0)
            }
        };

        let acquired_at = Instant::now();
        let session: SessionSlot = Arc::new(SessionMutex::new(Some(session)));
        lock(&self.state).active.insert(
            id,
            CheckoutRecord {
                session: Arc::clone(&session),
                owner_tag: owner_tag.clone(),
                call_site,
                acquired_at,
            },
        );

        Ok(PooledConnection {
            id,
            session,
            permit: Some(permit),
            created_at,
            acquired_at,
            use_count: use_count + 1,
            owner_tag,
            call_site,
            state: ConnectionState::Active,
            pool: Arc::clone(self),
        })
    }

    /// Ping a session that sat idle past `health_check_after`. A session that
    /// fails the ping is closed and `None` is returned.
    async fn check_idle(&self, mut conn: IdleConnection, budget: Duration) -> Option<IdleConnection> {
        if conn.idle_since.elapsed() < self.config.health_check_after {
            lock(&self.state).stats.total_reused += 1;
            return Some(conn);
        }

        // Uncounted while the ping is in flight; a cancelled checkout just drops it
        {
            let mut state = lock(&self.state);
            state.total = state.total.saturating_sub(1);
        }

        let error = match tokio::time::timeout(budget, conn.session.ping()).await {
            Ok(Ok(())) => {
                let mut state = lock(&self.state);
                state.total += 1;
                state.stats.total_reused += 1;
                return Some(conn);
            }
            Ok(Err(e)) => e,
            Err(_) => DbError::Timeout,
        };

        lock(&self.state).stats.total_retired += 1;
        warn!(
            connection_id = conn.id,
            idle_ms = conn.idle_since.elapsed().as_millis() as u64,
            error = %error,
            "Idle connection failed liveness check"
        );
        None
    }

    fn is_expired(&self, created_at: Instant, idle_since: Instant, now: Instant) -> bool {
        now.duration_since(created_at) >= self.config.max_lifetime
            || now.duration_since(idle_since) >= self.config.max_idle_duration
    }

    fn metrics(&self) -> PoolMetrics {
        let state = lock(&self.state);
        PoolMetrics {
            pool_size: state.total,
            idle: state.idle.len(),
            checked_out: state.active.len(),
            waiting_count: self.waiting.load(Ordering::SeqCst),
            max_size: self.config.max_size,
            stats: state.stats.clone(),
        }
    }

    /// Synchronous half of a release: bookkeeping and accounting.
    /// Returns `true` when the checkout had already been reclaimed.
    fn begin_return(&self, returning: &Returning) -> bool {
        let reclaimed = lock(&self.state).active.remove(&returning.id).is_none();
        if reclaimed {
            debug!(connection_id = returning.id, "Reclaimed connection returned late");
            return true;
        }

        match &returning.owner_tag {
            Some(tag) => self.ledger.record_release(tag),
            None => {
                let tag = untracked_tag(returning.call_site);
                if self.ledger.record_untracked(&tag) {
                    warn!(owner_tag = %tag, "untracked_acquisition");
                }
            }
        }
        false
    }

    /// Asynchronous half of a release: reset the session and put it back
    async fn complete_return(&self, returning: Returning, reclaimed: bool) {
        let Returning {
            id,
            session,
            created_at,
            use_count,
            broken,
            permit,
            ..
        } = returning;

        if reclaimed {
            // Capacity was already handed back when the checkout was reclaimed
            permit.forget();
            return;
        }

        let Some(mut session) = session else {
            let mut state = lock(&self.state);
            state.total = state.total.saturating_sub(1);
            state.stats.total_retired += 1;
            drop(permit);
            return;
        };

        let mut retire = broken || lock(&self.state).closed || self.manager.has_broken(session.as_ref());

        if !retire && session.in_transaction() {
            match tokio::time::timeout(self.config.connect_timeout, session.rollback()).await {
                Ok(Ok(())) => debug!(connection_id = id, "Rolled back open transaction on release"),
                Ok(Err(e)) => {
                    warn!(connection_id = id, error = %e, "Rollback on release failed");
                    retire = true;
                }
                Err(_) => {
                    warn!(connection_id = id, "Rollback on release timed out");
                    retire = true;
                }
            }
        }

        let now = Instant::now();
        if !retire && now.duration_since(created_at) >= self.config.max_lifetime {
            retire = true;
        }

        {
            let mut state = lock(&self.state);
            if retire {
                state.total = state.total.saturating_sub(1);
                state.stats.total_retired += 1;
            } else {
                state.idle.push_back(IdleConnection {
                    id,
                    session,
                    created_at,
                    idle_since: now,
                    use_count,
                });
            }
        }

        if retire {
            debug!(connection_id = id, "Retired connection on release");
        }
        drop(permit);
    }

    /// Release without a runtime: nothing can be awaited, so the session is closed
    fn discard(&self, returning: Returning, reclaimed: bool) {
        if reclaimed {
            returning.permit.forget();
            return;
        }
        let mut state = lock(&self.state);
        state.total = state.total.saturating_sub(1);
        state.stats.total_retired += 1;
    }

    /// Retire expired idle sessions and reclaim abandoned checkouts
    fn reap(&self) {
        let now = Instant::now();
        let (retired, reclaimed) = {
            let mut state = lock(&self.state);

            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut retired = Vec::new();
            let mut live = state.total;
            // Oldest first so the most recently used sessions survive
            while let Some(conn) = state.idle.pop_front() {
                let past_lifetime = now.duration_since(conn.created_at) >= self.config.max_lifetime;
                let past_idle = now.duration_since(conn.idle_since) >= self.config.max_idle_duration;
                if past_lifetime || (past_idle && live > self.config.min_size) {
                    live -= 1;
                    retired.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            state.idle = kept;
            state.total = live;
            state.stats.total_retired += retired.len() as u64;

            let mut reclaimed = Vec::new();
            if let Some(limit) = self.config.reclaim_after {
                let stale: Vec<u64> = state
                    .active
                    .iter()
                    .filter(|(_, record)| now.duration_since(record.acquired_at) >= limit)
                    .map(|(id, _)| *id)
                    .collect();
                for id in stale {
                    // A holder mid-operation keeps its slot locked until the operation ends
                    let session = match state.active.get(&id).map(|record| record.session.try_lock()) {
                        Some(Ok(mut slot)) => slot.take(),
                        _ => None,
                    };
                    let Some(session) = session else {
                        continue;
                    };
                    if let Some(record) = state.active.remove(&id) {
                        reclaimed.push((id, record, session));
                    }
                }
                state.total = state.total.saturating_sub(reclaimed.len());
                state.stats.total_reclaimed += reclaimed.len() as u64;
            }

            (retired, reclaimed)
        };

        if !retired.is_empty() {
            debug!(
                role = %self.config.role,
                retired = retired.len(),
                "Retired idle connections"
            );
        }

        for (id, record, session) in reclaimed {
            // Close the holder's session before its capacity is handed out again
            drop(session);
            self.semaphore.add_permits(1);
            let tag = record
                .owner_tag
                .unwrap_or_else(|| untracked_tag(record.call_site));
            self.ledger.record_leak(&tag);
            warn!(
                connection_id = id,
                owner_tag = %tag,
                held_ms = now.duration_since(record.acquired_at).as_millis() as u64,
                "connection_reclaimed"
            );
        }
    }

    /// Open sessions until `min_size` are live. Uses a permit per session so
    /// warming never competes past `max_size`.
    async fn replenish(&self) -> Result<usize, PoolError> {
        let mut opened = 0;
        loop {
            {
                let state = lock(&self.state);
                if state.closed || state.total >= self.config.min_size {
                    return Ok(opened);
                }
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return Ok(opened);
            };
            let session = tokio::time::timeout(self.config.connect_timeout, self.manager.connect())
                .await
                .map_err(|_| PoolError::Connect(DbError::Timeout))??;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            {
                let mut state = lock(&self.state);
                state.total += 1;
                state.stats.total_created += 1;
                state.idle.push_back(IdleConnection {
                    id,
                    session,
                    created_at: now,
                    idle_since: now,
                    use_count: 0,
                });
            }
            drop(permit);
            opened += 1;
        }
    }
}

struct Returning {
    id: u64,
    /// `None` once the reaper has taken the session
    session: Option<Box<dyn DbSession>>,
    permit: OwnedSemaphorePermit,
    created_at: Instant,
    use_count: u64,
    owner_tag: Option<String>,
    call_site: &'static Location<'static>,
    broken: bool,
}

/// A checked-out session.
///
/// Exactly one holder at a time. Call [`PooledConnection::release`] to return it
/// and wait for the reset to finish; dropping the guard releases it too, with
/// the reset running on a background task.
pub struct PooledConnection {
    id: u64,
    session: SessionSlot,
    permit: Option<OwnedSemaphorePermit>,
    created_at: Instant,
    acquired_at: Instant,
    use_count: u64,
    owner_tag: Option<String>,
    call_site: &'static Location<'static>,
    state: ConnectionState,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying session.
    ///
    /// Fails with [`DbError::Closed`] once the checkout has been reclaimed by
    /// the reaper. Hold the returned guard for the length of one unit of work.
    pub async fn session(&mut self) -> Result<MappedMutexGuard<'_, dyn DbSession + 'static>, DbError> {
        let slot = self.session.lock().await;
        tokio::sync::MutexGuard::try_map(slot, |session| session.as_deref_mut()).map_err(|_| DbError::Closed)
    }

    /// Whether the reaper has taken this checkout's session
    pub fn is_reclaimed(&self) -> bool {
        match self.session.try_lock() {
            Ok(slot) => slot.is_none(),
            Err(_) => false,
        }
    }

    pub fn owner_tag(&self) -> Option<&str> {
        self.owner_tag.as_deref()
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Age of the underlying session
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of checkouts this session has served, including this one
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retire the session on release instead of returning it to the idle set
    pub fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    /// Return the connection and wait until it is back in the pool
    pub async fn release(mut self) {
        if let Some(returning) = self.take_returning() {
            let reclaimed = self.pool.begin_return(&returning);
            self.pool.complete_return(returning, reclaimed).await;
        }
    }

    fn take_returning(&mut self) -> Option<Returning> {
        let permit = self.permit.take()?;
        // Only the reaper can hold the slot here, and only while taking the session
        let session = self.session.try_lock().ok().and_then(|mut slot| slot.take());
        Some(Returning {
            id: self.id,
            session,
            permit,
            created_at: self.created_at,
            use_count: self.use_count,
            owner_tag: self.owner_tag.take(),
            call_site: self.call_site,
            broken: self.state == ConnectionState::Broken,
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(returning) = self.take_returning() else {
            return;
        };
        let reclaimed = self.pool.begin_return(&returning);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    pool.complete_return(returning, reclaimed).await;
                });
            }
            Err(_) => self.pool.discard(returning, reclaimed),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("owner_tag", &self.owner_tag)
            .field("state", &self.state)
            .field("use_count", &self.use_count)
            .finish()
    }
}

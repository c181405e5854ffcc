//! Connection accounting and leak detection
//!
//! The [`Ledger`] keeps one [`AccountingRecord`] per owner tag (one per call
//! site, not per request). The [`Accountant`] is the tracked acquisition path:
//! every connection it hands out is counted before the caller sees it, and the
//! pool counts the release when the guard comes back.
//!
//! Comparing the pool's own checked-out count with the ledger's active total
//! exposes code paths that obtained a connection some other way.

use std::collections::HashMap;
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::{ConnectionPool, PoolError, PooledConnection};

/// Prefix of the synthetic owner tags registered for untracked checkouts
pub const UNTRACKED_PREFIX: &str = "UNTRACKED:";

/// Synthetic owner tag for a checkout made without the accountant
pub fn untracked_tag(call_site: &Location<'_>) -> String {
    format!("{}{}:{}", UNTRACKED_PREFIX, call_site.file(), call_site.line())
}

/// Counters for one owner tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountingRecord {
    pub acquired: u64,
    pub released: u64,
    /// Checkouts the pool reclaimed because their holder never released them
    pub leaked: u64,
}

impl AccountingRecord {
    /// Connections currently held under this tag
    pub fn active(&self) -> u64 {
        self.acquired.saturating_sub(self.released + self.leaked)
    }
}

/// Aggregate of every record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackingSnapshot {
    pub acquired: u64,
    pub released: u64,
    pub active: u64,
    pub leaked: u64,
}

/// Tracking section of the status report
#[derive(Debug, Clone, Serialize)]
pub struct TrackingReport {
    pub acquired: u64,
    pub released: u64,
    pub active: u64,
    pub leaked: u64,
    pub discrepancy: i64,
    pub untracked_sites: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerTagActive {
    pub owner_tag: String,
    pub active: u64,
}

/// Per-tag acquisition ledger
#[derive(Debug, Default)]
pub struct Ledger {
    records: Mutex<HashMap<String, AccountingRecord>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn records_mut(&self) -> MutexGuard<'_, HashMap<String, AccountingRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_acquire(&self, owner_tag: &str) {
        self.records_mut()
            .entry(owner_tag.to_string())
            .or_default()
            .acquired += 1;
    }

    pub fn record_release(&self, owner_tag: &str) {
        self.records_mut()
            .entry(owner_tag.to_string())
            .or_default()
            .released += 1;
    }

    pub fn record_leak(&self, owner_tag: &str) {
        self.records_mut()
            .entry(owner_tag.to_string())
            .or_default()
            .leaked += 1;
    }

    /// Register a synthetic acquisition + release for an untracked checkout
    /// that just came back. Returns `true` the first time the tag is seen.
    pub fn record_untracked(&self, tag: &str) -> bool {
        let mut records = self.records_mut();
        let first_time = !records.contains_key(tag);
        let record = records.entry(tag.to_string()).or_default();
        record.acquired += 1;
        record.released += 1;
        first_time
    }

    pub fn record(&self, owner_tag: &str) -> Option<AccountingRecord> {
        self.records_mut().get(owner_tag).cloned()
    }

    /// All records, sorted by tag
    pub fn records(&self) -> Vec<(String, AccountingRecord)> {
        let mut records: Vec<_> = self
            .records_mut()
            .iter()
            .map(|(tag, record)| (tag.clone(), record.clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        self.records_mut()
            .values()
            .fold(TrackingSnapshot::default(), |mut total, record| {
                total.acquired += record.acquired;
                total.released += record.released;
                total.leaked += record.leaked;
                total.active += record.active();
                total
            })
    }

    pub fn total_active(&self) -> u64 {
        self.snapshot().active
    }

    /// Tags holding the most connections right now
    pub fn top_owner_tags_by_active(&self, limit: usize) -> Vec<OwnerTagActive> {
        let mut top: Vec<OwnerTagActive> = self
            .records_mut()
            .iter()
            .filter(|(_, record)| record.active() > 0)
            .map(|(tag, record)| OwnerTagActive {
                owner_tag: tag.clone(),
                active: record.active(),
            })
            .collect();
        top.sort_by(|a, b| b.active.cmp(&a.active).then_with(|| a.owner_tag.cmp(&b.owner_tag)));
        top.truncate(limit);
        top
    }
}

/// The tracked acquisition path in front of the pool
pub struct Accountant {
    pool: Arc<ConnectionPool>,
    ledger: Arc<Ledger>,
    observer: Option<Arc<dyn AcquireObserver>>,
}

/// Notified around every tracked checkout, so pool pressure is seen as it
/// builds rather than on the next periodic sample
pub trait AcquireObserver: Send + Sync {
    fn pool_activity(&self);
}

impl Accountant {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let ledger = Arc::clone(pool.ledger());
        Self {
            pool,
            ledger,
            observer: None,
        }
    }

    /// Accountant that notifies `observer` before and after each checkout
    pub fn with_observer(pool: Arc<ConnectionPool>, observer: Arc<dyn AcquireObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(pool)
        }
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer.pool_activity();
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Acquire a connection on behalf of `owner_tag`, waiting at most `timeout`.
    ///
    /// The acquisition is counted before the connection is returned.
    #[track_caller]
    pub fn acquire<'a>(
        &'a self,
        owner_tag: &'a str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<PooledConnection, PoolError>> + 'a {
        let call_site = Location::caller();
        async move {
            self.notify();
            let result = self.pool.checkout_tagged(owner_tag, call_site, timeout).await;
            if result.is_ok() {
                self.ledger.record_acquire(owner_tag);
            }
            self.notify();
            result
        }
    }

    /// [`Accountant::acquire`] with the pool's configured timeout
    #[track_caller]
    pub fn acquire_default<'a>(
        &'a self,
        owner_tag: &'a str,
    ) -> impl std::future::Future<Output = Result<PooledConnection, PoolError>> + 'a {
        let timeout = self.pool.config().acquire_timeout;
        self.acquire(owner_tag, timeout)
    }

    /// `pool.checked_out − ledger.active`. Positive means some live connection
    /// was obtained without going through the accountant.
    pub fn discrepancy(&self) -> i64 {
        let checked_out = self.pool.metrics().checked_out as i64;
        checked_out - self.ledger.total_active() as i64
    }

    pub fn leaked_recovered(&self) -> u64 {
        self.ledger.snapshot().leaked
    }

    /// Owner tags of live untracked checkouts
    pub fn untracked_sites(&self) -> Vec<String> {
        self.pool.untracked_sites()
    }

    pub fn tracking(&self) -> TrackingReport {
        let snapshot = self.ledger.snapshot();
        TrackingReport {
            acquired: snapshot.acquired,
            released: snapshot.released,
            active: snapshot.active,
            leaked: snapshot.leaked,
            discrepancy: self.discrepancy(),
            untracked_sites: self.untracked_sites(),
        }
    }

    /// Periodically log tracking discrepancies and growing leak counts.
    ///
    /// A discrepancy is only reported once it persists across two samples,
    /// since one acquisition can be in flight between pool and ledger.
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut previous_discrepancy = 0i64;
            let mut previous_leaked = self.leaked_recovered();
            loop {
                ticker.tick().await;

                let discrepancy = self.discrepancy();
                if discrepancy != 0 && previous_discrepancy != 0 {
                    warn!(
                        discrepancy = discrepancy,
                        untracked_sites = ?self.untracked_sites(),
                        "tracking_discrepancy"
                    );
                } else {
                    debug!(discrepancy = discrepancy, "Tracking check");
                }
                previous_discrepancy = discrepancy;

                let leaked = self.leaked_recovered();
                if leaked > previous_leaked {
                    warn!(
                        leaked = leaked,
                        new = leaked - previous_leaked,
                        "leaked_connections_recovered"
                    );
                }
                previous_leaked = leaked;
            }
        })
    }
}

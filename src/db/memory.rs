//! In-process simulated database
//!
//! Backs the test-suite, the `simulate` command and the demo server. It knows
//! a single table of versioned tenant resources and the transaction verbs.
//! Reachability, latency and query failures can be switched at runtime to
//! reproduce a slow, saturated or unreachable database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ConnectionManager, DbError, DbSession};

/// Statement understood by the simulated backend to read a tenant resource.
/// Arguments: `[tenant_id, kind]`. Returns zero or one `{payload, version}` row.
pub const SELECT_RESOURCE: &str = "SELECT payload, version FROM tenant_resources WHERE tenant_id = $1 AND kind = $2";

/// Statement understood by the simulated backend to store a tenant resource.
/// Arguments: `[tenant_id, kind, payload_json]`. Returns one `{version}` row.
pub const UPSERT_RESOURCE: &str = "UPSERT tenant_resources (tenant_id, kind, payload) VALUES ($1, $2, $3)";

#[derive(Default)]
struct Inner {
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    fail_queries: AtomicU32,
    connects: AtomicU64,
    queries: AtomicU64,
    rollbacks: AtomicU64,
    open_sessions: AtomicU64,
    /// Sessions opened before the current epoch have been cut by the server
    epoch: AtomicU64,
    next_session: AtomicU64,
    resources: Mutex<HashMap<(String, String), (serde_json::Value, u64)>>,
}

/// Cloneable handle to a simulated database
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let inner = Inner::default();
        inner.reachable.store(true, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Make every connect and every operation fail with `Unreachable`
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Delay applied to every operation
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `n` queries with a query error
    pub fn fail_next_queries(&self, n: u32) {
        self.inner.fail_queries.store(n, Ordering::SeqCst);
    }

    /// Seed or overwrite a tenant resource, returning its new version
    pub fn put_resource(&self, tenant_id: &str, kind: &str, payload: serde_json::Value) -> u64 {
        let mut resources = match self.inner.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = (tenant_id.to_string(), kind.to_string());
        let version = resources.get(&key).map(|(_, v)| v + 1).unwrap_or(1);
        resources.insert(key, (payload, version));
        version
    }

    /// Cut every session opened so far, as a server restart would. New
    /// connections are unaffected.
    pub fn sever_sessions(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> u64 {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> u64 {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionManager for MemoryDatabase {
    async fn connect(&self) -> Result<Box<dyn DbSession>, DbError> {
        self.inner.simulate_latency().await;
        if !self.is_reachable() {
            return Err(DbError::Unreachable("connection refused".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            id,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            db: Arc::clone(&self.inner),
            in_transaction: false,
            broken: false,
        }))
    }

    fn has_broken(&self, session: &dyn DbSession) -> bool {
        session.is_broken() || !self.is_reachable()
    }
}

impl Inner {
    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Session against a [`MemoryDatabase`]
pub struct MemorySession {
    id: u64,
    epoch: u64,
    db: Arc<Inner>,
    in_transaction: bool,
    broken: bool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn round_trip(&mut self) -> Result<(), DbError> {
        self.db.simulate_latency().await;
        if !self.db.reachable.load(Ordering::SeqCst) || self.epoch < self.db.epoch.load(Ordering::SeqCst) {
            self.broken = true;
            return Err(DbError::Unreachable("connection reset".to_string()));
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.db.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DbSession for MemorySession {
    async fn execute(&mut self, statement: &str) -> Result<u64, DbError> {
        self.round_trip().await?;
        match statement.trim().to_ascii_uppercase().as_str() {
            "BEGIN" => self.in_transaction = true,
            "COMMIT" | "ROLLBACK" => self.in_transaction = false,
            _ => {}
        }
        Ok(0)
    }

    async fn query(
        &mut self,
        statement: &str,
        args: &[&str],
    ) -> Result<Vec<serde_json::Value>, DbError> {
        self.round_trip().await?;
        self.db.queries.fetch_add(1, Ordering::SeqCst);
        if self.db.take_injected_failure() {
            return Err(DbError::Query("injected failure".to_string()));
        }

        let mut resources = match self.db.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if statement == SELECT_RESOURCE {
            let [tenant, kind] = args else {
                return Err(DbError::Query(format!("expected 2 arguments, got {}", args.len())));
            };
            let key = (tenant.to_string(), kind.to_string());
            return Ok(resources
                .get(&key)
                .map(|(payload, version)| {
                    vec![serde_json::json!({ "payload": payload, "version": version })]
                })
                .unwrap_or_default());
        }

        if statement == UPSERT_RESOURCE {
            let [tenant, kind, body] = args else {
                return Err(DbError::Query(format!("expected 3 arguments, got {}", args.len())));
            };
            let payload: serde_json::Value = serde_json::from_str(body)
                .map_err(|e| DbError::Query(format!("invalid payload: {}", e)))?;
            let key = (tenant.to_string(), kind.to_string());
            let version = resources.get(&key).map(|(_, v)| v + 1).unwrap_or(1);
            resources.insert(key, (payload, version));
            return Ok(vec![serde_json::json!({ "version": version })]);
        }

        Err(DbError::Query(format!("unsupported statement: {}", statement)))
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.round_trip().await?;
        self.in_transaction = false;
        self.db.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        self.round_trip().await
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_and_upsert() {
        let db = MemoryDatabase::new();
        let mut session = db.connect().await.unwrap();

        let rows = session.query(SELECT_RESOURCE, &["acme", "odds"]).await.unwrap();
        assert!(rows.is_empty());

        let rows = session
            .query(UPSERT_RESOURCE, &["acme", "odds", r#"{"home": 1.5}"#])
            .await
            .unwrap();
        assert_eq!(rows[0]["version"], 1);

        let rows = session.query(SELECT_RESOURCE, &["acme", "odds"]).await.unwrap();
        assert_eq!(rows[0]["payload"]["home"], 1.5);
        assert_eq!(rows[0]["version"], 1);
    }

    #[tokio::test]
    async fn test_transaction_flags() {
        let db = MemoryDatabase::new();
        let mut session = db.connect().await.unwrap();

        session.execute("BEGIN").await.unwrap();
        assert!(session.in_transaction());
        session.rollback().await.unwrap();
        assert!(!session.in_transaction());
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_breaks_session() {
        let db = MemoryDatabase::new();
        let mut session = db.connect().await.unwrap();

        db.set_reachable(false);
        assert!(matches!(session.ping().await, Err(DbError::Unreachable(_))));
        assert!(session.is_broken());
        assert!(db.has_broken(session.as_ref()));
        assert!(db.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_severed_sessions_fail_while_new_ones_work() {
        let db = MemoryDatabase::new();
        let mut old = db.connect().await.unwrap();
        assert_eq!(db.open_sessions(), 1);

        db.sever_sessions();
        assert!(matches!(old.ping().await, Err(DbError::Unreachable(_))));
        assert!(old.is_broken());

        let mut fresh = db.connect().await.unwrap();
        assert!(fresh.ping().await.is_ok());
        assert_eq!(db.open_sessions(), 2);

        drop(old);
        drop(fresh);
        assert_eq!(db.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let db = MemoryDatabase::new();
        let mut session = db.connect().await.unwrap();

        db.fail_next_queries(1);
        assert!(session.query(SELECT_RESOURCE, &["a", "b"]).await.is_err());
        assert!(session.query(SELECT_RESOURCE, &["a", "b"]).await.is_ok());
    }
}

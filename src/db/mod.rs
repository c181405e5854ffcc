//! Database seam
//!
//! The pool never knows what database it talks to. Everything it needs from a
//! session goes through [`DbSession`], and new sessions come from a
//! [`ConnectionManager`]. Business logic run while holding a connection is
//! opaque to this crate and only sees `&mut dyn DbSession`.

pub mod memory;

use async_trait::async_trait;

pub use memory::MemoryDatabase;

/// Errors reported by a database session or connector
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DbError {
    #[error("Database unreachable: {0}")]
    Unreachable(String),

    #[error("Database operation timed out")]
    Timeout,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Session is closed")]
    Closed,
}

/// A live database session
#[async_trait]
pub trait DbSession: Send + Sync + 'static {
    /// Run a statement that returns no rows, returning the affected row count
    async fn execute(&mut self, statement: &str) -> Result<u64, DbError>;

    /// Run a statement that returns rows
    async fn query(
        &mut self,
        statement: &str,
        args: &[&str],
    ) -> Result<Vec<serde_json::Value>, DbError>;

    /// Whether the session has an open transaction
    fn in_transaction(&self) -> bool;

    /// Roll back the open transaction, if any
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Cheap liveness round-trip. The pool runs it before reusing a session
    /// that sat idle past its health-check threshold.
    async fn ping(&mut self) -> Result<(), DbError>;

    /// Whether the session saw a fatal error and must not be reused
    fn is_broken(&self) -> bool {
        false
    }
}

/// Opens new sessions for the pool
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// Open a brand new session
    async fn connect(&self) -> Result<Box<dyn DbSession>, DbError>;

    /// Synchronous check run when a session comes back to the pool.
    /// Broken sessions are retired instead of re-entering the idle set.
    fn has_broken(&self, session: &dyn DbSession) -> bool;
}

//! Connection pooling, accounting and circuit breaker module
//!
//! This module provides:
//! - A bounded pool of database sessions with timeout-bounded acquisition
//! - Per-call-site accounting of acquisitions and releases
//! - Detection of connections obtained outside the accounting path
//! - A circuit breaker driven by pool utilization

pub mod accounting;
pub mod circuit;
pub mod connection;

pub use accounting::{
    AccountingRecord, Accountant, AcquireObserver, Ledger, OwnerTagActive, TrackingReport, TrackingSnapshot,
    UNTRACKED_PREFIX,
};
pub use circuit::{
    BreakerMachine, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats,
    OperationPermit, Reading,
};
pub use connection::{
    ConnectionPool, ConnectionState, PoolConfig, PoolError, PoolMetrics, PoolStats,
    PooledConnection,
};

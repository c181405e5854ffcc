//! poolguard - Bounded database connection pool with saturation guards
//!
//! A shared, bounded pool of database sessions protected by a
//! utilization-driven circuit breaker, a per-tenant stale-while-revalidate
//! cache, a per-tenant token bucket limiter and connection accounting that
//! exposes leaks and untracked checkouts.

pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod db;
pub mod health;
pub mod limiter;
pub mod pool;
pub mod server;
pub mod worker;

pub use config::Config;
pub use core::Core;

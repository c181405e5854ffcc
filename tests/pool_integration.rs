//! Integration tests for connection pool and circuit breaker
//!
//! These tests verify that the pool, the accountant and the breaker work
//! correctly together in realistic scenarios.

use poolguard::db::MemoryDatabase;
use poolguard::pool::{
    AcquireObserver, Accountant, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionPool, Ledger,
    PoolConfig, PoolError,
};
use std::sync::Arc;
use std::time::Duration;

fn setup(
    role: &str,
    max_size: usize,
    breaker: CircuitBreakerConfig,
) -> (Arc<Accountant>, Arc<CircuitBreaker>, MemoryDatabase) {
    let db = MemoryDatabase::new();
    let pool = Arc::new(
        ConnectionPool::new(
            PoolConfig {
                role: role.to_string(),
                min_size: 0,
                max_size,
                reap_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            Arc::new(db.clone()),
            Arc::new(Ledger::new()),
        )
        .unwrap(),
    );
    let accountant = Arc::new(Accountant::new(Arc::clone(&pool)));
    let breaker = Arc::new(CircuitBreaker::new(breaker, pool));
    (accountant, breaker, db)
}

/// Like `setup`, but every tracked checkout drives the breaker
fn setup_observed(
    role: &str,
    max_size: usize,
    breaker: CircuitBreakerConfig,
) -> (Arc<Accountant>, Arc<CircuitBreaker>) {
    let (plain, breaker, _db) = setup(role, max_size, breaker);
    let pool = Arc::clone(plain.pool());
    let accountant = Arc::new(Accountant::with_observer(
        pool,
        Arc::clone(&breaker) as Arc<dyn AcquireObserver>,
    ));
    (accountant, breaker)
}

#[tokio::test]
async fn test_pool_and_circuit_integration() {
    let (accountant, breaker, _db) = setup("it-basic", 10, CircuitBreakerConfig::default());

    // Verify initial state
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(!breaker.should_bypass_db_for_reads());

    let conn = accountant.acquire("odds_reader", Duration::from_secs(1)).await.unwrap();
    let metrics = accountant.pool().metrics();
    assert_eq!(metrics.checked_out, 1);
    assert_eq!(metrics.pool_size, 1);
    assert_eq!(breaker.evaluate(), CircuitState::Closed);

    conn.release().await;
    let metrics = accountant.pool().metrics();
    assert_eq!(metrics.checked_out, 0);
    assert_eq!(metrics.idle, 1);
}

#[tokio::test]
async fn test_circuit_opens_on_utilization() {
    let (accountant, breaker, _db) = setup("it-utilization", 10, CircuitBreakerConfig {
        open_utilization_threshold: 0.8,
        ..Default::default()
    });

    let mut held = Vec::new();
    for _ in 0..7 {
        held.push(accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap());
    }
    assert_eq!(breaker.evaluate(), CircuitState::Closed);

    held.push(accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap());
    assert!(breaker.evaluate().is_open());
    assert!(breaker.should_bypass_db_for_reads());
    assert_eq!(breaker.stats().open_count, 1);

    for conn in held {
        conn.release().await;
    }
}

#[tokio::test]
async fn test_circuit_opens_on_waiters() {
    let (accountant, breaker, _db) = setup("it-waiters", 1, CircuitBreakerConfig {
        // Unreachable threshold so only waiters can open it
        open_utilization_threshold: 2.0,
        open_waiting_threshold: 2,
        ..Default::default()
    });

    let held = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    assert_eq!(breaker.evaluate(), CircuitState::Closed);

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let accountant = Arc::clone(&accountant);
        waiters.push(tokio::spawn(async move {
            accountant.acquire("odds_reader", Duration::from_millis(500)).await.map(drop)
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accountant.pool().metrics().waiting_count, 2);
    assert!(breaker.evaluate().is_open());

    held.release().await;
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_circuit_recovery_flow() {
    let (accountant, breaker, _db) = setup("it-recovery", 10, CircuitBreakerConfig {
        cooldown_duration: Duration::from_millis(50),
        ..Default::default()
    });

    let mut held = Vec::new();
    for _ in 0..9 {
        held.push(accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap());
    }
    assert!(breaker.evaluate().is_open());
    for conn in held {
        conn.release().await;
    }

    // Still open until the cooldown elapses, whatever the reading
    assert!(breaker.evaluate().is_open());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(matches!(breaker.evaluate(), CircuitState::HalfOpen { .. }));

    // One trial; everyone else keeps bypassing while it runs
    let trial = breaker.begin_operation();
    assert!(trial.is_trial());
    assert!(breaker.should_bypass_db_for_reads());
    let second = breaker.begin_operation();
    assert!(!second.is_trial());
    second.succeeded();

    trial.succeeded();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(!breaker.should_bypass_db_for_reads());
}

#[tokio::test]
async fn test_failed_trial_reopens() {
    let (accountant, breaker, _db) = setup("it-failed-trial", 10, CircuitBreakerConfig {
        cooldown_duration: Duration::from_millis(30),
        ..Default::default()
    });

    let mut held = Vec::new();
    for _ in 0..9 {
        held.push(accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap());
    }
    breaker.evaluate();
    for conn in held {
        conn.release().await;
    }
    tokio::time::sleep(Duration::from_millis(40)).await;
    breaker.evaluate();

    // Dropped without a verdict counts as a failure
    drop(breaker.begin_operation());
    assert!(breaker.state().is_open());
    assert_eq!(breaker.stats().open_count, 2);
    assert_eq!(breaker.stats().trial_count, 1);
}

#[tokio::test]
async fn test_critical_write_timeout_shrinks_when_not_closed() {
    let (accountant, breaker, _db) = setup("it-write-timeout", 2, CircuitBreakerConfig {
        critical_write_timeout: Duration::from_millis(100),
        ..Default::default()
    });

    assert_eq!(breaker.write_timeout(Duration::from_secs(5)), Duration::from_secs(5));

    let a = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    let b = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    let timeout = breaker.write_timeout(Duration::from_secs(5));
    assert_eq!(timeout, Duration::from_millis(100));

    let started = std::time::Instant::now();
    let err = accountant.acquire("critical_write:bets", timeout).await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(accountant.pool().metrics().stats.total_timeouts, 1);

    a.release().await;
    b.release().await;
}

#[tokio::test]
async fn test_pool_statistics() {
    let (accountant, _breaker, db) = setup("it-stats", 4, CircuitBreakerConfig::default());

    for _ in 0..5 {
        let conn = accountant.acquire("odds_reader", Duration::from_secs(1)).await.unwrap();
        conn.release().await;
    }

    let metrics = accountant.pool().metrics();
    assert_eq!(metrics.stats.total_created, 1);
    assert_eq!(metrics.stats.total_reused, 4);
    assert_eq!(db.connect_count(), 1);

    let record = accountant.ledger().record("odds_reader").unwrap();
    assert_eq!(record.acquired, 5);
    assert_eq!(record.released, 5);
}

#[tokio::test]
async fn test_circuit_manual_reset() {
    let (accountant, breaker, _db) = setup("it-reset", 2, CircuitBreakerConfig::default());

    let a = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    let b = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    assert!(breaker.evaluate().is_open());

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);

    a.release().await;
    b.release().await;
    assert_eq!(breaker.evaluate(), CircuitState::Closed);
}

#[tokio::test]
async fn test_second_pool_for_role_is_rejected() {
    let (accountant, _breaker, db) = setup("it-single-pool", 2, CircuitBreakerConfig::default());

    let second = ConnectionPool::new(
        PoolConfig {
            role: "it-single-pool".to_string(),
            ..Default::default()
        },
        Arc::new(db),
        Arc::new(Ledger::new()),
    );
    assert!(matches!(second, Err(PoolError::DuplicatePool(role)) if role == "it-single-pool"));
    assert_eq!(accountant.pool().metrics().pool_size, 0);
}

#[tokio::test]
async fn test_tracked_checkouts_open_breaker_without_tick() {
    let (accountant, breaker) = setup_observed("it-observed", 2, CircuitBreakerConfig {
        open_utilization_threshold: 0.8,
        ..Default::default()
    });

    let a = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let b = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();
    assert!(breaker.state().is_open());
    assert_eq!(breaker.stats().open_count, 1);

    a.release().await;
    b.release().await;
}

#[tokio::test]
async fn test_waiter_burst_opens_breaker_without_tick() {
    let (accountant, breaker) = setup_observed("it-observed-waiters", 1, CircuitBreakerConfig {
        open_utilization_threshold: 2.0,
        open_waiting_threshold: 2,
        ..Default::default()
    });

    let held = accountant.acquire("settlement", Duration::from_secs(1)).await.unwrap();

    // Two callers queue up and give up; the third sees them waiting on arrival
    let mut waiters = Vec::new();
    for _ in 0..2 {
        let accountant = Arc::clone(&accountant);
        waiters.push(tokio::spawn(async move {
            accountant.acquire("odds_reader", Duration::from_millis(100)).await.map(drop)
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(breaker.state(), CircuitState::Closed);

    let third = accountant.acquire("odds_reader", Duration::from_millis(10)).await;
    assert!(matches!(third, Err(PoolError::Timeout { .. })));
    assert!(breaker.state().is_open());

    for waiter in waiters {
        assert!(waiter.await.unwrap().is_err());
    }
    held.release().await;
}

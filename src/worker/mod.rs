//! Background worker discipline
//!
//! Workers (odds ingestion, settlement) acquire a connection, do their
//! database work and release it before anything else. Retries sleep with the
//! connection already back in the pool, and the sleep is jittered so replicas
//! woken on the same schedule spread out.

use futures::future::BoxFuture;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::{DbError, DbSession};
use crate::pool::{Accountant, PoolError};

/// Jittered exponential backoff.
///
/// Delay for attempt `n` is `min(max, base × 2^n) × uniform(0.5, 1.5)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = self.delay_with_jitter(self.attempt, jitter);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay for `attempt` with an explicit jitter factor
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let capped = self.base.saturating_mul(factor).min(self.max);
        capped.mul_f64(jitter)
    }
}

/// Retry settings for a worker operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    pub base_delay: Duration,

    pub max_delay: Duration,

    /// Acquire timeout for each attempt
    pub acquire_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl WorkerError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Pool(PoolError::Timeout { .. }) => true,
            WorkerError::Pool(PoolError::Connect(_)) => true,
            WorkerError::Pool(_) => false,
            WorkerError::Database(DbError::Unreachable(_)) => true,
            WorkerError::Database(DbError::Timeout) => true,
            WorkerError::Database(_) => false,
        }
    }
}

/// Run `op` against a tracked connection, retrying transient failures.
///
/// Every attempt acquires under `owner_tag`, runs `op` and releases before
/// any backoff sleep, so a waiting worker never holds a connection.
pub async fn run_with_retry<T, F>(
    accountant: &Accountant,
    owner_tag: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, WorkerError>
where
    F: for<'c> FnMut(&'c mut dyn DbSession) -> BoxFuture<'c, Result<T, DbError>>,
{
    let mut backoff = Backoff::new(policy.base_delay, policy.max_delay);
    let max_attempts = policy.max_attempts.max(1);

    loop {
        let attempt = backoff.attempt() + 1;
        let result = attempt_once(accountant, owner_tag, policy.acquire_timeout, &mut op).await;

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !error.is_retryable() || attempt >= max_attempts {
            warn!(
                owner_tag = owner_tag,
                attempt = attempt,
                error = %error,
                "worker_operation_failed"
            );
            return Err(error);
        }

        let delay = backoff.next_delay();
        debug!(
            owner_tag = owner_tag,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retry_backoff"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn attempt_once<T, F>(
    accountant: &Accountant,
    owner_tag: &str,
    timeout: Duration,
    op: &mut F,
) -> Result<T, WorkerError>
where
    F: for<'c> FnMut(&'c mut dyn DbSession) -> BoxFuture<'c, Result<T, DbError>>,
{
    let mut conn = accountant.acquire(owner_tag, timeout).await?;
    let result = match conn.session().await {
        Ok(mut session) => op(&mut *session).await,
        Err(e) => Err(e),
    };
    if matches!(result, Err(DbError::Unreachable(_))) {
        conn.mark_broken();
    }
    conn.release().await;
    Ok(result?)
}

//! Utilization-driven circuit breaker
//!
//! This module implements a circuit breaker with three states:
//! - Closed: Normal operation, reads and writes go to the database
//! - Open: The pool is saturated; reads are served from cache, writes run with
//!   an aggressive timeout
//! - HalfOpen: Cooldown elapsed; the next database operation is a trial
//!
//! Transitions are driven by pool readings (utilization and waiters), evaluated
//! on every acquisition attempt and on a periodic tick. Only HalfOpen looks at
//! operation outcomes, and only for the single trial operation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::accounting::AcquireObserver;
use super::connection::ConnectionPool;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - the database may be used
    Closed,

    /// Pool saturated - reads bypass the database
    Open {
        /// When the circuit last opened; cooldown is measured from here
        open_since: Instant,
    },

    /// Cooldown elapsed - one trial operation decides the next state
    HalfOpen {
        /// Whether the trial has been handed out
        trial_in_flight: bool,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Open when `checked_out / max_size` reaches this fraction
    pub open_utilization_threshold: f64,

    /// Open when this many callers are waiting for a connection
    pub open_waiting_threshold: usize,

    /// How long to stay open before allowing a trial
    pub cooldown_duration: Duration,

    /// Interval of the periodic evaluation
    pub tick_interval: Duration,

    /// Acquire timeout for critical writes while the circuit is not closed
    pub critical_write_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            open_utilization_threshold: 0.85,
            open_waiting_threshold: 5,
            cooldown_duration: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            critical_write_timeout: Duration::from_millis(500),
        }
    }
}

/// Pool reading the state machine is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub utilization: f64,
    pub waiting_count: usize,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Current state name
    pub state: &'static str,

    /// Last utilization reading
    pub utilization: f64,

    /// Last waiting-count reading
    pub waiting_count: usize,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Number of trials run in HalfOpen
    pub trial_count: u64,

    /// Time since last state transition
    pub time_in_state_ms: u64,
}

/// The state machine, free of any pool so it can be driven directly
#[derive(Debug)]
pub struct BreakerMachine {
    config: CircuitBreakerConfig,
    state: CircuitState,
    last_reading: Reading,
    last_transition: Instant,
    open_count: u64,
    trial_count: u64,
}

impl BreakerMachine {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            last_reading: Reading {
                utilization: 0.0,
                waiting_count: 0,
            },
            last_transition: Instant::now(),
            open_count: 0,
            trial_count: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Apply a pool reading taken at `now`
    pub fn observe(&mut self, reading: Reading, now: Instant) -> CircuitState {
        self.last_reading = reading;

        match self.state {
            CircuitState::Closed => {
                if reading.utilization >= self.config.open_utilization_threshold
                    || reading.waiting_count >= self.config.open_waiting_threshold
                {
                    warn!(
                        utilization = reading.utilization,
                        waiting_count = reading.waiting_count,
                        "breaker_opened"
                    );
                    self.transition_to_open(now);
                }
            }

            CircuitState::Open { open_since } => {
                if now.duration_since(open_since) >= self.config.cooldown_duration {
                    info!("Circuit transitioning from Open to HalfOpen");
                    self.transition_to_half_open(now);
                }
            }

            // HalfOpen only moves on the trial outcome
            CircuitState::HalfOpen { .. } => {}
        }

        self.state
    }

    /// Hand out the trial if one is due. Returns `true` when the caller got it.
    pub fn claim_trial(&mut self) -> bool {
        if let CircuitState::HalfOpen { trial_in_flight: false } = self.state {
            self.state = CircuitState::HalfOpen { trial_in_flight: true };
            self.trial_count += 1;
            return true;
        }
        false
    }

    /// Record the trial outcome
    pub fn finish_trial(&mut self, success: bool, now: Instant) {
        if !matches!(self.state, CircuitState::HalfOpen { trial_in_flight: true }) {
            return;
        }
        if success {
            info!("Circuit transitioning from HalfOpen to Closed");
            self.transition_to_closed(now);
        } else {
            warn!("Trial failed in HalfOpen state - reopening circuit");
            self.transition_to_open(now);
        }
    }

    /// Whether non-critical reads must stay off the database
    pub fn bypass_reads(&self) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open { .. } => true,
            CircuitState::HalfOpen { trial_in_flight } => trial_in_flight,
        }
    }

    fn transition_to_closed(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.last_transition = now;
    }

    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open { open_since: now };
        self.open_count += 1;
        self.last_transition = now;
    }

    fn transition_to_half_open(&mut self, now: Instant) {
        self.state = CircuitState::HalfOpen {
            trial_in_flight: false,
        };
        self.last_transition = now;
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state.name(),
            utilization: self.last_reading.utilization,
            waiting_count: self.last_reading.waiting_count,
            open_count: self.open_count,
            trial_count: self.trial_count,
            time_in_state_ms: self.last_transition.elapsed().as_millis() as u64,
        }
    }
}

/// Circuit breaker watching the shared pool
pub struct CircuitBreaker {
    pool: Arc<ConnectionPool>,
    config: CircuitBreakerConfig,
    machine: Mutex<BreakerMachine>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            machine: Mutex::new(BreakerMachine::new(config.clone())),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn machine(&self) -> MutexGuard<'_, BreakerMachine> {
        match self.machine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Read the pool and apply any due transition
    pub fn evaluate(&self) -> CircuitState {
        let metrics = self.pool.metrics();
        let reading = Reading {
            utilization: metrics.utilization(),
            waiting_count: metrics.waiting_count,
        };
        self.machine().observe(reading, Instant::now())
    }

    pub fn state(&self) -> CircuitState {
        self.machine().state()
    }

    /// `true` while non-critical reads must be served from cache or defaults
    pub fn should_bypass_db_for_reads(&self) -> bool {
        self.evaluate();
        self.machine().bypass_reads()
    }

    /// Start a database operation. In HalfOpen the first caller gets the trial.
    pub fn begin_operation(&self) -> OperationPermit<'_> {
        self.evaluate();
        let trial = self.machine().claim_trial();
        if trial {
            debug!("Trial operation admitted in HalfOpen state");
        }
        OperationPermit {
            breaker: self,
            trial,
            settled: false,
        }
    }

    /// Acquire timeout to use for a critical write
    pub fn write_timeout(&self, default: Duration) -> Duration {
        match self.evaluate() {
            CircuitState::Closed => default,
            _ => default.min(self.config.critical_write_timeout),
        }
    }

    pub fn stats(&self) -> CircuitStats {
        self.machine().stats()
    }

    /// Manually force the circuit closed
    pub fn reset(&self) {
        info!("Manually resetting circuit to Closed");
        self.machine().transition_to_closed(Instant::now());
    }

    /// Evaluate on a fixed tick
    pub fn spawn_ticker(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.evaluate();
            }
        })
    }

    fn finish_trial(&self, success: bool) {
        self.machine().finish_trial(success, Instant::now());
    }
}

impl AcquireObserver for CircuitBreaker {
    fn pool_activity(&self) {
        self.evaluate();
    }
}

/// A database operation admitted by the breaker.
///
/// Only trial permits affect the state. A trial permit dropped without a
/// verdict counts as a failed trial.
pub struct OperationPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl OperationPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeeded(mut self) {
        self.settle(true);
    }

    pub fn failed(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, success: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        if self.trial {
            self.breaker.finish_trial(success);
        }
    }
}

impl Drop for OperationPermit<'_> {
    fn drop(&mut self) {
        self.settle(false);
    }
}

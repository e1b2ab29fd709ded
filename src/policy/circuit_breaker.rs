//! Circuit breaker around the policy database connection.
//!
//! Closed: calls pass through. Five consecutive failures trip it Open,
//! rejecting calls for a timeout. The first call after the timeout enters
//! HalfOpen; three consecutive successes close it, one failure reopens it.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics::CIRCUIT_BREAKER_STATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable snapshot of breaker state and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            opened_at: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    /// Gate a call. `Err(())` means the call must be rejected immediately;
    /// the caller maps it to its own circuit-open error.
    pub fn preflight(&mut self) -> Result<(), ()> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    self.transition(BreakerState::HalfOpen);
                    self.consecutive_successes = 0;
                    Ok(())
                } else {
                    self.total_rejections += 1;
                    Err(())
                }
            }
        }
    }

    /// Record the outcome of a call that passed preflight.
    pub fn observe(&mut self, success: bool) {
        if success {
            self.total_successes += 1;
            self.consecutive_failures = 0;
            match self.state {
                BreakerState::Closed => {}
                BreakerState::HalfOpen => {
                    self.consecutive_successes += 1;
                    if self.consecutive_successes >= self.config.success_threshold {
                        self.transition(BreakerState::Closed);
                    }
                }
                BreakerState::Open => {}
            }
        } else {
            self.total_failures += 1;
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            match self.state {
                BreakerState::Closed => {
                    if self.consecutive_failures >= self.config.failure_threshold {
                        self.trip();
                    }
                }
                BreakerState::HalfOpen => self.trip(),
                BreakerState::Open => {}
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
        }
    }

    fn trip(&mut self) {
        self.opened_at = Some(Instant::now());
        self.transition(BreakerState::Open);
    }

    fn transition(&mut self, to: BreakerState) {
        if self.state == to {
            return;
        }
        match to {
            BreakerState::Open => {
                warn!(failures = self.consecutive_failures, "Security: policy store circuit breaker opened")
            }
            BreakerState::HalfOpen => info!("policy store circuit breaker half-open, probing"),
            BreakerState::Closed => info!("policy store circuit breaker closed"),
        }
        self.state = to;
        CIRCUIT_BREAKER_STATE.set(to.gauge_value());
    }
}

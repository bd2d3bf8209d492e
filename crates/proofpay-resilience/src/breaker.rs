//! Circuit breaker
//!
//! Transitions:
//! - Closed → Open after `failure_threshold` consecutive failures, all inside
//!   the rolling `failure_window`
//! - Open → HalfOpen once `reset_timeout` has elapsed
//! - HalfOpen → Closed after `success_threshold` successful trial calls
//! - HalfOpen → Open on any failed trial call

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_ms() -> u64 {
    60_000
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_requests() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_requests: default_half_open_max_requests(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerConfig {
    fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Timestamps of consecutive failures while closed
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
}

/// Snapshot of a breaker for health reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub last_transition: DateTime<Utc>,
}

/// A named circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying a pending open → half-open transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        inner.state
    }

    /// May a request go through now?
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(breaker = %self.name, "Circuit breaker closing after successful trial call");
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Success recorded while circuit open");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                let window = self.config.failure_window();
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                let failures = inner.failures.len();
                if failures as u32 >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = failures,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Circuit breaker re-opening after failed trial call");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run an operation through the breaker.
    ///
    /// Rejected with [`ResilienceError::CircuitOpen`] while open. Only
    /// transient errors count as failures; a 4xx answer proves the remote is up.
    pub async fn call<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.allow_request() {
            return Err(ResilienceError::CircuitOpen {
                name: self.name.clone(),
            });
        }
        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_transient() => self.record_failure(),
            Err(_) => self.release_trial(),
        }
        result
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition_to(&mut inner, CircuitState::Closed);
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            last_transition: inner.last_transition,
        }
    }

    /// A non-transient outcome in half-open neither closes nor re-opens
    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn check_timeout(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= self.config.reset_timeout() {
                info!(breaker = %self.name, "Circuit breaker half-open after reset timeout");
                self.transition_to(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        inner.state = new_state;
        inner.last_transition = Utc::now();
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        match new_state {
            CircuitState::Closed => {
                inner.failures.clear();
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.failures.clear();
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {}
        }
    }
}

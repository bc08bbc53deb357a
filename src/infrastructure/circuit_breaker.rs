//! Circuit Breaker Pattern
//!
//! Stops issuing calls to a persistently failing dependency for a cooldown window.

use crate::domain::entities::ConnectionState;
use crate::domain::errors::{CallError, CircuitOpenError};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a probation call is allowed
    pub recovery_timeout: Duration,
    /// Consecutive probation successes needed to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Circuit tripped - calls short-circuited
    Open,
    /// Probation - calls pass, any failure re-opens
    HalfOpen,
}

impl CircuitState {
    /// The health classification this breaker state corresponds to.
    pub fn as_connection_state(&self) -> ConnectionState {
        match self {
            CircuitState::Closed => ConnectionState::Healthy,
            CircuitState::Open => ConnectionState::CircuitOpen,
            CircuitState::HalfOpen => ConnectionState::Degraded,
        }
    }
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

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Consecutive failures (reset by any success)
    failures: u32,
    /// Consecutive successes while half-open
    successes: u32,
    last_failure: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
        }
    }
}

/// Circuit breaker guarding a single named connection.
///
/// Bookkeeping is serialized by an internal lock, which is never held
/// while the wrapped call runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker.
    ///
    /// While open and inside the recovery window, fails with
    /// [`CallError::CircuitOpen`] without invoking `f`.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.before_call()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CallError::Failed(e))
            }
        }
    }

    /// Admit or reject a call, moving an expired open circuit to half-open.
    fn before_call(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let since_failure = inner
            .last_failure
            .map(|t| t.elapsed())
            .unwrap_or(self.config.recovery_timeout);

        if since_failure >= self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            tracing::info!("circuit breaker for {} transitioning to half-open", self.name);
            Ok(())
        } else {
            Err(CircuitOpenError {
                name: self.name.clone(),
                retry_after: self.config.recovery_timeout - since_failure,
            })
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.successes += 1;
            if inner.successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.successes = 0;
                tracing::info!("circuit breaker for {} closed (recovered)", self.name);
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        "circuit breaker for {} opened after {} failures",
                        self.name,
                        inner.failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.successes = 0;
                tracing::warn!(
                    "circuit breaker for {} re-opened (failed in half-open)",
                    self.name
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Current state. An open circuit stays `Open` until a call is attempted.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// State the next call would see. An open circuit past its recovery
    /// window reads as half-open without being transitioned.
    pub fn current_state(&self) -> CircuitState {
        let state = self.state();
        if state == CircuitState::Open && self.open_until().is_none() {
            CircuitState::HalfOpen
        } else {
            state
        }
    }

    /// When an open circuit will admit its next probation call. `None` once
    /// the recovery window has passed.
    pub fn open_until(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(t)) => {
                let until = t + self.config.recovery_timeout;
                (until > Instant::now()).then_some(until)
            }
            _ => None,
        }
    }

    /// Manually reset the circuit to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
        tracing::info!("circuit breaker for {} manually reset", self.name);
    }
}

//! Domain Errors
//!
//! Error types shared by the monitors and the pool manager.

use std::time::Duration;

/// Raised instead of invoking the wrapped call while a circuit is open.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("circuit breaker for {name} is open (retry in {:.1}s)", .retry_after.as_secs_f64())]
pub struct CircuitOpenError {
    pub name: String,
    /// Time left until the breaker lets a probation call through
    pub retry_after: Duration,
}

/// Outcome of a call routed through a circuit breaker.
///
/// `Failed` carries the wrapped call's own error, untouched.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::CircuitOpen(_))
    }

    /// The wrapped call's error, if the call actually ran.
    pub fn into_failure(self) -> Option<E> {
        match self {
            CallError::Failed(e) => Some(e),
            CallError::CircuitOpen(_) => None,
        }
    }
}

/// Registration of a name or id that is already tracked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(String),
}

/// Background monitor lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
    #[error("no tokio runtime available to start {0}")]
    NoRuntime(&'static str),
}

//! Domain Entities - Core bookkeeping records
//!
//! These records describe the observed state of pooled connections. They are
//! plain data: the monitors own and mutate them, everything else reads copies.

use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Observed health classification of a named connection.
///
/// Distinct from the circuit breaker's own state, but kept in step with it:
/// an open circuit is always reported as `CircuitOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Calls succeed with acceptable latency
    Healthy,
    /// Calls succeed slowly, or fail occasionally
    Degraded,
    /// More than half of observed calls failed
    Unhealthy,
    /// Circuit breaker is rejecting calls
    CircuitOpen,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Healthy => "healthy",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Unhealthy => "unhealthy",
            ConnectionState::CircuitOpen => "circuit_open",
        }
    }

    /// Whether traffic should still be routed to this connection.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Healthy | ConnectionState::Degraded)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Healthy
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection health record.
///
/// Timestamps are seconds since the Unix epoch so the record can be served
/// as-is by the monitoring endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<f64>,
    pub last_failure: Option<f64>,
    /// Running average over successful calls, in seconds
    pub avg_response_time: f64,
    pub state: ConnectionState,
    pub circuit_open_until: Option<f64>,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

impl HealthMetrics {
    /// Total number of observed calls.
    pub fn total_calls(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Fraction of observed calls that failed (0.0 when nothing was observed).
    pub fn failure_ratio(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }
}

/// Lifecycle record for a tracked connection handle.
///
/// Holds identifiers and timestamps only; the live handle is looked up
/// through the pool registry by `connection_id`.
#[derive(Debug, Clone)]
pub struct ConnectionLeak {
    pub connection_id: String,
    pub created_at: Instant,
    pub last_used: Instant,
    pub connection_type: String,
    pub is_active: bool,
}

impl ConnectionLeak {
    pub fn new(connection_id: impl Into<String>, connection_type: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            connection_id: connection_id.into(),
            created_at: now,
            last_used: now,
            connection_type: connection_type.into(),
            is_active: true,
        }
    }

    pub fn age(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    pub fn idle_time(&self) -> f64 {
        self.last_used.elapsed().as_secs_f64()
    }
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Convert a monotonic instant in the past to an approximate Unix timestamp.
pub fn instant_to_unix(instant: Instant) -> f64 {
    unix_now() - instant.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Healthy.to_string(), "healthy");
        assert_eq!(ConnectionState::Degraded.to_string(), "degraded");
        assert_eq!(ConnectionState::Unhealthy.to_string(), "unhealthy");
        assert_eq!(ConnectionState::CircuitOpen.to_string(), "circuit_open");
    }

    #[test]
    fn test_connection_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
    }

    #[test]
    fn test_connection_state_usable() {
        assert!(ConnectionState::Healthy.is_usable());
        assert!(ConnectionState::Degraded.is_usable());
        assert!(!ConnectionState::Unhealthy.is_usable());
        assert!(!ConnectionState::CircuitOpen.is_usable());
    }

    #[test]
    fn test_failure_ratio() {
        let mut metrics = HealthMetrics::default();
        assert_eq!(metrics.failure_ratio(), 0.0);

        metrics.success_count = 1;
        metrics.failure_count = 3;
        assert_eq!(metrics.total_calls(), 4);
        assert!((metrics.failure_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_connection_leak_new() {
        let leak = ConnectionLeak::new("svc-1", "http_session");
        assert!(leak.is_active);
        assert_eq!(leak.connection_type, "http_session");
        assert!(leak.idle_time() < 1.0);
    }

    #[test]
    fn test_instant_to_unix_is_in_the_past() {
        let earlier = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(instant_to_unix(earlier) <= unix_now());
    }
}

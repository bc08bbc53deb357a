//! Connection Health Monitor
//!
//! Tracks per-connection health metrics, guards each connection with a
//! circuit breaker, and periodically runs a health probe against every
//! registered connection.

use crate::domain::entities::{unix_now, ConnectionState, HealthMetrics};
use crate::domain::errors::{CallError, MonitorError, RegistrationError};
use crate::domain::ports::HealthCheck;
use crate::infrastructure::backoff::BackoffCalculator;
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::infrastructure::monitor_task::MonitorTask;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between probe passes
    pub check_interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
    /// Successful calls slower than this mark the connection degraded
    pub slow_call_threshold: Duration,
    /// Breaker settings for newly registered connections
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            slow_call_threshold: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Health record plus breaker state, as served to dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    #[serde(flatten)]
    pub metrics: HealthMetrics,
    pub circuit_state: CircuitState,
}

struct MonitoredConnection {
    name: String,
    metrics: Mutex<HealthMetrics>,
    breaker: CircuitBreaker,
    health_check: Arc<dyn HealthCheck>,
}

impl MonitoredConnection {
    fn record_success(&self, elapsed: Duration, slow_call_threshold: Duration) {
        let mut m = self.metrics.lock();
        m.success_count += 1;
        m.last_success = Some(unix_now());

        let n = m.success_count as f64;
        m.avg_response_time = (m.avg_response_time * (n - 1.0) + elapsed.as_secs_f64()) / n;

        m.state = if elapsed > slow_call_threshold {
            ConnectionState::Degraded
        } else {
            ConnectionState::Healthy
        };
        self.sync_circuit(&mut m);
    }

    fn record_failure(&self, error: &str) {
        let mut m = self.metrics.lock();
        m.failure_count += 1;
        m.last_failure = Some(unix_now());

        m.state = if m.failure_ratio() > 0.5 {
            ConnectionState::Unhealthy
        } else {
            ConnectionState::Degraded
        };
        self.sync_circuit(&mut m);

        tracing::debug!(
            "connection {} failure #{} ({}): {}",
            self.name,
            m.failure_count,
            m.state,
            error
        );
    }

    /// An open breaker always overrides the observed state.
    fn sync_circuit(&self, m: &mut HealthMetrics) {
        match self.breaker.open_until() {
            Some(until) => {
                let remaining = until.saturating_duration_since(Instant::now());
                m.state = ConnectionState::CircuitOpen;
                m.circuit_open_until = Some(unix_now() + remaining.as_secs_f64());
            }
            None => m.circuit_open_until = None,
        }
    }

    fn begin_call(&self) -> InFlight<'_> {
        let mut m = self.metrics.lock();
        m.active_connections += 1;
        m.peak_connections = m.peak_connections.max(m.active_connections);
        InFlight { conn: self }
    }

    fn snapshot(&self) -> HealthSnapshot {
        let mut metrics = self.metrics.lock().clone();
        self.sync_circuit(&mut metrics);
        HealthSnapshot {
            metrics,
            circuit_state: self.breaker.current_state(),
        }
    }
}

/// Decrements the in-flight count when the wrapped call finishes.
struct InFlight<'a> {
    conn: &'a MonitoredConnection,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut m = self.conn.metrics.lock();
        m.active_connections = m.active_connections.saturating_sub(1);
    }
}

/// Registry of named connections with health metrics and circuit breakers.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    connections: Arc<DashMap<String, Arc<MonitoredConnection>>>,
    task: MonitorTask,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            connections: Arc::new(DashMap::new()),
            task: MonitorTask::new("health monitor"),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Register a connection with its probe and breaker failure threshold.
    pub fn register_connection(
        &self,
        name: &str,
        health_check: Arc<dyn HealthCheck>,
        failure_threshold: u32,
    ) -> Result<(), RegistrationError> {
        use dashmap::mapref::entry::Entry;

        match self.connections.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistrationError::AlreadyRegistered(name.to_string())),
            Entry::Vacant(slot) => {
                let breaker = CircuitBreaker::new(
                    name,
                    CircuitBreakerConfig {
                        failure_threshold,
                        ..self.config.circuit_breaker.clone()
                    },
                );
                slot.insert(Arc::new(MonitoredConnection {
                    name: name.to_string(),
                    metrics: Mutex::new(HealthMetrics::default()),
                    breaker,
                    health_check,
                }));
                tracing::debug!("registered connection {} for health monitoring", name);
                Ok(())
            }
        }
    }

    /// Stop tracking a connection. Returns false for unknown names.
    pub fn unregister_connection(&self, name: &str) -> bool {
        self.connections.remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Start the background probe loop.
    pub fn start_monitoring(&self) -> Result<(), MonitorError> {
        let connections = self.connections.clone();
        let timeout = self.config.probe_timeout;
        let slow = self.config.slow_call_threshold;

        self.task.start(self.config.check_interval, move || {
            let connections = connections.clone();
            async move {
                Self::check_connections(&connections, timeout, slow).await;
            }
        })
    }

    /// Stop the background probe loop, waiting a bounded time for it to exit.
    pub async fn stop_monitoring(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_monitoring(&self) -> bool {
        self.task.is_running()
    }

    /// Run one probe pass over every registered connection.
    ///
    /// Returns the number of failed probes.
    pub async fn check_all(&self) -> usize {
        Self::check_connections(
            &self.connections,
            self.config.probe_timeout,
            self.config.slow_call_threshold,
        )
        .await
    }

    async fn check_connections(
        connections: &DashMap<String, Arc<MonitoredConnection>>,
        timeout: Duration,
        slow_call_threshold: Duration,
    ) -> usize {
        let targets: Vec<Arc<MonitoredConnection>> =
            connections.iter().map(|e| e.value().clone()).collect();

        let mut failed = 0;
        for conn in targets {
            match Self::probe(&conn, timeout).await {
                Ok(latency) => conn.record_success(latency, slow_call_threshold),
                Err(e) => {
                    failed += 1;
                    tracing::warn!("health check failed for {}: {}", conn.name, e);
                    conn.record_failure(&e);
                }
            }
        }
        failed
    }

    /// Run a probe in its own task so a panic or hang counts as a failure.
    async fn probe(conn: &MonitoredConnection, timeout: Duration) -> Result<Duration, String> {
        let check = conn.health_check.clone();
        let start = Instant::now();
        let handle = tokio::spawn(async move { check.check().await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => Ok(start.elapsed()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(format!("health check aborted: {}", e)),
            Err(_) => {
                abort.abort();
                Err(format!("health check timed out after {:?}", timeout))
            }
        }
    }

    /// Run `f` with retries, routed through the connection's circuit breaker.
    ///
    /// Unregistered names call `f` directly without bookkeeping. A circuit
    /// already open before the first attempt is returned as a rejection. A
    /// failure that opens the circuit stops the retries and is returned as-is,
    /// as is the last failure of `f` once `max_attempts` are exhausted.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        name: &str,
        mut f: F,
        max_attempts: u32,
        backoff: &BackoffCalculator,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let conn = self.connections.get(name).map(|e| e.value().clone());
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let start = Instant::now();
            let result = match &conn {
                Some(conn) => {
                    let _in_flight = conn.begin_call();
                    conn.breaker.call(&mut f).await
                }
                None => f().await.map_err(CallError::Failed),
            };

            match result {
                Ok(value) => {
                    if let Some(conn) = &conn {
                        conn.record_success(start.elapsed(), self.config.slow_call_threshold);
                    }
                    return Ok(value);
                }
                Err(CallError::CircuitOpen(e)) => {
                    tracing::warn!("call to {} rejected: {}", name, e);
                    return Err(CallError::CircuitOpen(e));
                }
                Err(CallError::Failed(e)) => {
                    attempt += 1;
                    if let Some(conn) = &conn {
                        conn.record_failure(&e.to_string());
                        if conn.breaker.state() == CircuitState::Open {
                            tracing::error!(
                                "circuit for {} opened on attempt {}/{}: {}",
                                name,
                                attempt,
                                max_attempts,
                                e
                            );
                            return Err(CallError::Failed(e));
                        }
                    }
                    if attempt >= max_attempts {
                        tracing::error!(
                            "call to {} failed after {} attempts: {}",
                            name,
                            max_attempts,
                            e
                        );
                        return Err(CallError::Failed(e));
                    }

                    let delay = backoff.get_delay(attempt - 1);
                    tracing::warn!(
                        "attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt,
                        max_attempts,
                        name,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// False for unknown names and open circuits; otherwise healthy or degraded.
    pub fn is_connection_healthy(&self, name: &str) -> bool {
        let Some(conn) = self.connections.get(name).map(|e| e.value().clone()) else {
            return false;
        };
        if conn.breaker.state() == CircuitState::Open {
            return false;
        }
        let usable = conn.metrics.lock().state.is_usable();
        usable
    }

    /// Health snapshot for one connection.
    pub fn get_metrics(&self, name: &str) -> Option<HealthSnapshot> {
        self.connections.get(name).map(|e| e.value().snapshot())
    }

    /// Health snapshots for every registered connection.
    pub fn all_metrics(&self) -> HashMap<String, HealthSnapshot> {
        self.connections
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.connections.get(name).map(|e| e.value().breaker.state())
    }

    /// Manually close a connection's breaker. Returns false for unknown names.
    pub fn reset_circuit(&self, name: &str) -> bool {
        let Some(conn) = self.connections.get(name).map(|e| e.value().clone()) else {
            return false;
        };
        conn.breaker.reset();
        let mut m = conn.metrics.lock();
        conn.sync_circuit(&mut m);
        if m.state == ConnectionState::CircuitOpen {
            m.state = ConnectionState::Degraded;
        }
        true
    }

    /// Add transferred byte counts to a connection's totals.
    pub fn record_transfer(&self, name: &str, bytes_sent: u64, bytes_received: u64) {
        if let Some(conn) = self.connections.get(name) {
            let mut m = conn.metrics.lock();
            m.total_bytes_sent += bytes_sent;
            m.total_bytes_received += bytes_received;
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorConfig::default())
    }
}

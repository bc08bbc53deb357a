//! Connection Pool Manager
//!
//! Owns the named pooled sessions and the three monitors that watch them.
//! One manager is built at process start and shared by reference.

use crate::domain::entities::{instant_to_unix, ConnectionLeak};
use crate::domain::errors::{CallError, MonitorError};
use crate::domain::ports::ResourceProbe;
use crate::infrastructure::backoff::{BackoffCalculator, BackoffConfig};
use crate::infrastructure::circuit_breaker::CircuitState;
use crate::infrastructure::health_monitor::{HealthMonitor, HealthMonitorConfig, HealthSnapshot};
use crate::infrastructure::leak_detector::{LeakDetector, LeakDetectorConfig, LeakStats};
use crate::infrastructure::pooled_session::{PooledSession, RetryPolicy, SessionInfo, SessionOptions};
use crate::infrastructure::resource_monitor::{ResourceMonitor, ResourceMonitorConfig, ResourceStats};
use dashmap::DashMap;
use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Leak-detector type tag for pooled sessions.
const SESSION_CONNECTION_TYPE: &str = "http_session";

/// Pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool {0} already exists")]
    AlreadyExists(String),
    #[error("pool {0} not found")]
    NotFound(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error("failed to build http client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    pub health: HealthMonitorConfig,
    pub enable_leak_detection: bool,
    pub leak: LeakDetectorConfig,
    pub resource: ResourceMonitorConfig,
    /// Backoff used when a caller does not supply one
    pub backoff: BackoffConfig,
    /// Defaults for `create_session`
    pub session: SessionOptions,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            health: HealthMonitorConfig::default(),
            enable_leak_detection: true,
            leak: LeakDetectorConfig::default(),
            resource: ResourceMonitorConfig::default(),
            backoff: BackoffConfig::default(),
            session: SessionOptions::default(),
        }
    }
}

/// Bookkeeping for one named pool.
struct PoolEntry {
    session: Arc<PooledSession>,
    created_at: Instant,
    last_used: Instant,
    request_count: u64,
    connection_id: String,
}

impl PoolEntry {
    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            session: self.session.info(),
            created_at: instant_to_unix(self.created_at),
            last_used: instant_to_unix(self.last_used),
            request_count: self.request_count,
        }
    }
}

/// Serializable view of a pool entry. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub created_at: f64,
    pub last_used: f64,
    pub request_count: u64,
}

/// Aggregated dashboard payload.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pools: BTreeMap<String, PoolSnapshot>,
    pub health_metrics: BTreeMap<String, HealthSnapshot>,
    /// Absent when leak detection is disabled
    pub leak_stats: Option<LeakStats>,
    pub resource_stats: ResourceStats,
    pub total_pools: usize,
}

/// Whether each background loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitoringStatus {
    pub health: bool,
    pub leak_detection: bool,
    pub resources: bool,
}

impl MonitoringStatus {
    pub fn any(&self) -> bool {
        self.health || self.leak_detection || self.resources
    }
}

/// Creates and tracks pooled sessions.
pub struct ConnectionPoolManager {
    config: PoolManagerConfig,
    pools: Arc<DashMap<String, PoolEntry>>,
    health: Arc<HealthMonitor>,
    leaks: Option<LeakDetector>,
    resources: ResourceMonitor,
    backoff: BackoffCalculator,
}

impl ConnectionPoolManager {
    /// Create a manager. Nothing runs until `start_monitoring`.
    pub fn new(config: PoolManagerConfig, probe: Box<dyn ResourceProbe>) -> Self {
        let pools: Arc<DashMap<String, PoolEntry>> = Arc::new(DashMap::new());

        let leaks = config.enable_leak_detection.then(|| {
            let detector = LeakDetector::new(config.leak.clone());
            let registry = pools.clone();
            detector.set_cleanup_hook(Arc::new(move |leak: &ConnectionLeak| {
                close_leaked_session(&registry, leak)
            }));
            detector
        });

        Self {
            health: Arc::new(HealthMonitor::new(config.health.clone())),
            resources: ResourceMonitor::new(config.resource.clone(), probe),
            backoff: BackoffCalculator::new(config.backoff.clone()),
            leaks,
            pools,
            config,
        }
    }

    pub fn config(&self) -> &PoolManagerConfig {
        &self.config
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn leak_detector(&self) -> Option<&LeakDetector> {
        self.leaks.as_ref()
    }

    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.resources
    }

    /// Create a pool with the configured session defaults.
    pub fn create_session(
        &self,
        name: &str,
        base_url: Option<&str>,
    ) -> Result<Arc<PooledSession>, PoolError> {
        let defaults = &self.config.session;
        self.create_session_with_pooling(
            name,
            base_url,
            defaults.pool_maxsize,
            defaults.max_retries,
            defaults.enable_keep_alive,
        )
    }

    /// Create a named pooled session and register it with the monitors.
    pub fn create_session_with_pooling(
        &self,
        name: &str,
        base_url: Option<&str>,
        pool_maxsize: usize,
        max_retries: u32,
        enable_keep_alive: bool,
    ) -> Result<Arc<PooledSession>, PoolError> {
        use dashmap::mapref::entry::Entry;

        let parsed = base_url
            .map(|url| Url::parse(url).map_err(|e| PoolError::InvalidUrl(format!("{}: {}", url, e))))
            .transpose()?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let options = SessionOptions {
            pool_maxsize,
            max_retries,
            enable_keep_alive,
            ..self.config.session.clone()
        };

        let session = match self.pools.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(PoolError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                let session = Arc::new(PooledSession::new(
                    name,
                    &connection_id,
                    parsed,
                    options,
                    RetryPolicy::new(max_retries, self.backoff.clone()),
                    Arc::downgrade(&self.health),
                )?);
                let now = Instant::now();
                slot.insert(PoolEntry {
                    session: session.clone(),
                    created_at: now,
                    last_used: now,
                    request_count: 0,
                    connection_id: connection_id.clone(),
                });
                session
            }
        };

        if let Some(leaks) = &self.leaks {
            if let Err(e) = leaks.register_connection(&connection_id, SESSION_CONNECTION_TYPE) {
                tracing::warn!("leak tracking for {} not registered: {}", name, e);
            }
        }

        if let Err(e) = self.health.register_connection(
            name,
            session.health_check(),
            self.config.health.circuit_breaker.failure_threshold,
        ) {
            tracing::warn!("health monitoring for {} keeps existing registration: {}", name, e);
        }

        tracing::info!(
            "created pool {} ({}, maxsize {}, retries {}, keep-alive {})",
            name,
            base_url.unwrap_or("no base url"),
            pool_maxsize,
            max_retries,
            enable_keep_alive
        );
        Ok(session)
    }

    pub fn get_session(&self, name: &str) -> Option<Arc<PooledSession>> {
        self.pools.get(name).map(|e| e.session.clone())
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Snapshot of every pool entry.
    pub fn pools(&self) -> BTreeMap<String, PoolSnapshot> {
        self.pools
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    /// Run `f` through the named connection's breaker with retries, then
    /// record the use on the pool entry whatever the outcome.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        name: &str,
        f: F,
        max_attempts: u32,
        backoff: Option<&BackoffCalculator>,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let backoff = backoff.unwrap_or(&self.backoff);
        let result = self
            .health
            .execute_with_retry(name, f, max_attempts, backoff)
            .await;
        self.touch(name);
        result
    }

    fn touch(&self, name: &str) {
        let connection_id = match self.pools.get_mut(name) {
            Some(mut entry) => {
                entry.request_count += 1;
                entry.last_used = Instant::now();
                entry.connection_id.clone()
            }
            None => return,
        };
        if let Some(leaks) = &self.leaks {
            leaks.update_connection_usage(&connection_id);
        }
    }

    pub fn is_connection_healthy(&self, name: &str) -> bool {
        self.health.is_connection_healthy(name)
    }

    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.health.circuit_state(name)
    }

    /// Manually close the named breaker. Returns false for unknown names.
    pub fn reset_circuit(&self, name: &str) -> bool {
        let reset = self.health.reset_circuit(name);
        if reset {
            tracing::info!("circuit for {} reset", name);
        }
        reset
    }

    /// Best-effort snapshot across all subsystems.
    pub fn get_metrics(&self) -> PoolMetrics {
        PoolMetrics {
            pools: self.pools(),
            health_metrics: self.health.all_metrics().into_iter().collect(),
            leak_stats: self.leaks.as_ref().map(|l| l.get_leak_stats()),
            resource_stats: self.resources.get_resource_stats(),
            total_pools: self.pools.len(),
        }
    }

    pub fn get_leak_stats(&self) -> Option<LeakStats> {
        self.leaks.as_ref().map(|l| l.get_leak_stats())
    }

    /// Close and forget a pool. Returns false for unknown names.
    pub fn force_cleanup_connection(&self, name: &str) -> bool {
        match self.pools.remove(name) {
            Some((_, entry)) => {
                self.release(name, entry);
                true
            }
            None => false,
        }
    }

    /// Remove `name` only if it is still idle, checked under the entry lock.
    fn remove_if_idle(&self, name: &str, max_idle_time: Duration) -> bool {
        match self
            .pools
            .remove_if(name, |_, e| e.last_used.elapsed() > max_idle_time)
        {
            Some((_, entry)) => {
                self.release(name, entry);
                true
            }
            None => false,
        }
    }

    fn release(&self, name: &str, entry: PoolEntry) {
        entry.session.close();
        if let Some(leaks) = &self.leaks {
            leaks.unregister_connection(&entry.connection_id);
        }
        self.health.unregister_connection(name);

        tracing::info!(
            "cleaned up pool {} ({} requests served)",
            name,
            entry.request_count
        );
    }

    /// Force-clean every pool unused for longer than `max_idle_time`.
    pub fn cleanup_idle_connections(&self, max_idle_time: Duration) -> usize {
        let idle: Vec<String> = self
            .pools
            .iter()
            .filter(|e| e.last_used.elapsed() > max_idle_time)
            .map(|e| e.key().clone())
            .collect();

        let removed = idle
            .iter()
            .filter(|name| self.remove_if_idle(name, max_idle_time))
            .count();
        if removed > 0 {
            tracing::info!("removed {} idle pools", removed);
        }
        removed
    }

    /// Start every monitor in a fixed order.
    ///
    /// A monitor that fails to start is logged and skipped; the failures are
    /// returned.
    pub fn start_monitoring(&self) -> Vec<MonitorError> {
        let mut failures = Vec::new();

        if let Err(e) = self.health.start_monitoring() {
            tracing::error!("failed to start health monitoring: {}", e);
            failures.push(e);
        }
        if let Some(leaks) = &self.leaks {
            if let Err(e) = leaks.start_cleanup() {
                tracing::error!("failed to start leak detection: {}", e);
                failures.push(e);
            }
        }
        if let Err(e) = self.resources.start_monitoring() {
            tracing::error!("failed to start resource monitoring: {}", e);
            failures.push(e);
        }

        failures
    }

    /// Stop every monitor. Returns false if any loop had to be abandoned.
    pub async fn stop_monitoring(&self) -> bool {
        let mut joined = self.health.stop_monitoring().await;
        if let Some(leaks) = &self.leaks {
            joined &= leaks.stop_cleanup().await;
        }
        joined &= self.resources.stop_monitoring().await;
        joined
    }

    pub fn is_monitoring(&self) -> MonitoringStatus {
        MonitoringStatus {
            health: self.health.is_monitoring(),
            leak_detection: self.leaks.as_ref().map(|l| l.is_running()).unwrap_or(false),
            resources: self.resources.is_monitoring(),
        }
    }

    /// Stop monitoring and close every pool. Safe to call repeatedly.
    pub async fn cleanup_pools(&self) {
        if !self.stop_monitoring().await {
            tracing::warn!("some monitors were abandoned during cleanup");
        }

        let names = self.pool_names();
        for name in &names {
            self.force_cleanup_connection(name);
        }
        self.pools.clear();

        if !names.is_empty() {
            tracing::info!("closed {} pools", names.len());
        }
    }
}

/// Leak cleanup hook: close the session that owns the leaked id.
fn close_leaked_session(
    pools: &DashMap<String, PoolEntry>,
    leak: &ConnectionLeak,
) -> Result<(), String> {
    let session = pools
        .iter()
        .find(|e| e.connection_id == leak.connection_id)
        .map(|e| e.session.clone());

    match session {
        Some(session) => {
            session.close();
            Ok(())
        }
        None => Err(format!("no pool owns connection {}", leak.connection_id)),
    }
}

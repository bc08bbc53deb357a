//! Connection Leak Detector
//!
//! Tracks the lifecycle of pooled connection handles and flags handles that
//! were never released, inferred from prolonged idleness.
//!
//! Only ids and timestamps are stored here. The live handle stays owned by
//! the pool registry; the optional cleanup hook looks it up by id.

use crate::domain::entities::ConnectionLeak;
use crate::domain::errors::{MonitorError, RegistrationError};
use crate::infrastructure::monitor_task::MonitorTask;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Leak detector configuration.
#[derive(Debug, Clone)]
pub struct LeakDetectorConfig {
    /// Interval between idle sweeps
    pub cleanup_interval: Duration,
    /// Active handles idle longer than this are considered leaked
    pub max_idle_time: Duration,
}

impl Default for LeakDetectorConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(300),
            max_idle_time: Duration::from_secs(3600),
        }
    }
}

/// Best-effort release of a leaked connection, given its tracking record.
pub type CleanupHook = Arc<dyn Fn(&ConnectionLeak) -> Result<(), String> + Send + Sync>;

/// Leak statistics. Ages and idle times are in seconds, over active records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeakStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub leaks_detected: u64,
    pub cleanup_runs: u64,
    pub connections_cleaned: u64,
    pub cleanup_failures: u64,
    pub avg_age: f64,
    pub max_age: f64,
    pub avg_idle_time: f64,
    pub max_idle_time: f64,
}

struct LeakInner {
    config: LeakDetectorConfig,
    connections: DashMap<String, ConnectionLeak>,
    leaks_detected: AtomicU64,
    cleanup_runs: AtomicU64,
    connections_cleaned: AtomicU64,
    cleanup_failures: AtomicU64,
    cleanup_hook: RwLock<Option<CleanupHook>>,
}

impl LeakInner {
    fn sweep(&self) -> usize {
        let max_idle = self.config.max_idle_time;
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.is_active && e.last_used.elapsed() > max_idle)
            .map(|e| e.key().clone())
            .collect();

        let hook = self.cleanup_hook.read().clone();
        let mut cleaned = 0;

        for id in idle {
            // Re-check under the entry lock: usage may have been bumped since.
            let record = match self.connections.get_mut(&id) {
                Some(mut entry) if entry.is_active && entry.last_used.elapsed() > max_idle => {
                    entry.is_active = false;
                    entry.clone()
                }
                _ => continue,
            };

            cleaned += 1;
            self.leaks_detected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "potential connection leak: {} ({}) idle for {:.0}s",
                record.connection_id,
                record.connection_type,
                record.idle_time()
            );

            if let Some(hook) = &hook {
                match catch_unwind(AssertUnwindSafe(|| hook(&record))) {
                    Ok(Ok(())) => {
                        self.connections_cleaned.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("failed to clean up leaked connection {}: {}", id, e);
                    }
                    Err(_) => {
                        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("cleanup hook panicked for leaked connection {}", id);
                    }
                }
            }
        }

        if cleaned > 0 {
            self.connections.shrink_to_fit();
            tracing::info!("leak sweep released {} idle connections", cleaned);
        }
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        cleaned
    }
}

/// Tracks connection handles and sweeps idle ones in the background.
pub struct LeakDetector {
    inner: Arc<LeakInner>,
    task: MonitorTask,
}

impl LeakDetector {
    pub fn new(config: LeakDetectorConfig) -> Self {
        Self {
            inner: Arc::new(LeakInner {
                config,
                connections: DashMap::new(),
                leaks_detected: AtomicU64::new(0),
                cleanup_runs: AtomicU64::new(0),
                connections_cleaned: AtomicU64::new(0),
                cleanup_failures: AtomicU64::new(0),
                cleanup_hook: RwLock::new(None),
            }),
            task: MonitorTask::new("leak detector"),
        }
    }

    pub fn config(&self) -> &LeakDetectorConfig {
        &self.inner.config
    }

    /// Install the hook invoked for every connection the sweep flags.
    pub fn set_cleanup_hook(&self, hook: CleanupHook) {
        *self.inner.cleanup_hook.write() = Some(hook);
    }

    /// Start tracking a connection handle.
    pub fn register_connection(
        &self,
        connection_id: &str,
        connection_type: &str,
    ) -> Result<(), RegistrationError> {
        use dashmap::mapref::entry::Entry;

        match self.inner.connections.entry(connection_id.to_string()) {
            Entry::Occupied(_) => Err(RegistrationError::AlreadyRegistered(
                connection_id.to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionLeak::new(connection_id, connection_type));
                tracing::debug!("tracking connection {} ({})", connection_id, connection_type);
                Ok(())
            }
        }
    }

    /// Bump `last_used`. Unknown ids are ignored.
    pub fn update_connection_usage(&self, connection_id: &str) {
        if let Some(mut entry) = self.inner.connections.get_mut(connection_id) {
            entry.last_used = std::time::Instant::now();
        }
    }

    /// Mark a handle as released. The record is kept for statistics.
    pub fn unregister_connection(&self, connection_id: &str) -> bool {
        match self.inner.connections.get_mut(connection_id) {
            Some(mut entry) => {
                entry.is_active = false;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionLeak> {
        self.inner.connections.get(connection_id).map(|e| e.value().clone())
    }

    /// Run one idle sweep now. Returns the number of connections flagged.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Start the background idle sweep.
    pub fn start_cleanup(&self) -> Result<(), MonitorError> {
        let inner = self.inner.clone();
        self.task.start(self.inner.config.cleanup_interval, move || {
            let inner = inner.clone();
            async move {
                inner.sweep();
            }
        })
    }

    pub async fn stop_cleanup(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn get_leak_stats(&self) -> LeakStats {
        let mut stats = LeakStats {
            total_connections: self.inner.connections.len(),
            leaks_detected: self.inner.leaks_detected.load(Ordering::Relaxed),
            cleanup_runs: self.inner.cleanup_runs.load(Ordering::Relaxed),
            connections_cleaned: self.inner.connections_cleaned.load(Ordering::Relaxed),
            cleanup_failures: self.inner.cleanup_failures.load(Ordering::Relaxed),
            ..Default::default()
        };

        let (mut age_sum, mut idle_sum) = (0.0, 0.0);
        for entry in self.inner.connections.iter().filter(|e| e.is_active) {
            let (age, idle) = (entry.age(), entry.idle_time());
            stats.active_connections += 1;
            age_sum += age;
            idle_sum += idle;
            stats.max_age = stats.max_age.max(age);
            stats.max_idle_time = stats.max_idle_time.max(idle);
        }

        if stats.active_connections > 0 {
            stats.avg_age = age_sum / stats.active_connections as f64;
            stats.avg_idle_time = idle_sum / stats.active_connections as f64;
        }
        stats
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new(LeakDetectorConfig::default())
    }
}

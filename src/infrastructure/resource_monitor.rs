//! Resource Monitor
//!
//! Periodically samples process and host resource usage, keeps a bounded
//! history per metric, and logs a warning when a threshold is crossed.
//! Purely observational: nothing here throttles or blocks work.

use crate::domain::entities::unix_now;
use crate::domain::errors::MonitorError;
use crate::domain::ports::ResourceProbe;
use crate::infrastructure::monitor_task::MonitorTask;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Alert thresholds. Reaching a threshold is not a breach; exceeding it is.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceThresholds {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub open_files: u64,
    pub network_connections: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_percent: 85.0,
            cpu_percent: 80.0,
            open_files: 1000,
            network_connections: 500,
        }
    }
}

/// Resource monitor configuration.
#[derive(Debug, Clone)]
pub struct ResourceMonitorConfig {
    /// Interval between samples
    pub monitoring_interval: Duration,
    pub thresholds: ResourceThresholds,
    /// Samples retained per metric
    pub history_size: usize,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(60),
            thresholds: ResourceThresholds::default(),
            history_size: 100,
        }
    }
}

/// One timestamped resource reading. Metrics that failed to collect are 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_rss: u64,
    pub process_vms: u64,
    pub open_files: u64,
    pub network_connections: u64,
}

impl ResourceSample {
    fn metric_values(&self) -> [(&'static str, f64); 6] {
        [
            ("cpu_percent", self.cpu_percent),
            ("memory_percent", self.memory_percent),
            ("process_rss", self.process_rss as f64),
            ("process_vms", self.process_vms as f64),
            ("open_files", self.open_files as f64),
            ("network_connections", self.network_connections as f64),
        ]
    }
}

/// Summary of one metric's rolling history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub current: f64,
    pub avg: f64,
    pub max: f64,
    pub min: f64,
}

/// Per-metric statistics, keyed by metric name.
pub type ResourceStats = BTreeMap<String, MetricStats>;

/// A threshold crossed by a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAlert {
    pub metric: &'static str,
    pub value: f64,
    pub threshold: f64,
}

struct ResourceInner {
    config: ResourceMonitorConfig,
    probe: Mutex<Box<dyn ResourceProbe>>,
    history: Mutex<BTreeMap<&'static str, VecDeque<f64>>>,
    latest: Mutex<Option<ResourceSample>>,
}

impl ResourceInner {
    fn sample(&self) -> ResourceSample {
        let mut sample = ResourceSample {
            timestamp: unix_now(),
            ..Default::default()
        };

        {
            let mut probe = self.probe.lock();
            sample.cpu_percent = degrade("cpu_percent", probe.cpu_percent());
            sample.memory_percent = degrade("memory_percent", probe.memory_percent());
            let (rss, vms) = degrade("process_memory", probe.process_memory());
            sample.process_rss = rss;
            sample.process_vms = vms;
            sample.open_files = degrade("open_files", probe.open_files());
            sample.network_connections =
                degrade("network_connections", probe.network_connections());
        }

        {
            let mut history = self.history.lock();
            for (metric, value) in sample.metric_values() {
                let series = history.entry(metric).or_default();
                series.push_back(value);
                while series.len() > self.config.history_size.max(1) {
                    series.pop_front();
                }
            }
        }
        *self.latest.lock() = Some(sample.clone());

        for alert in check_thresholds(&sample, &self.config.thresholds) {
            tracing::warn!(
                "resource threshold exceeded: {} = {:.1} (threshold {:.1})",
                alert.metric,
                alert.value,
                alert.threshold
            );
        }
        sample
    }
}

/// A failed reading degrades to the zero value for this sample only.
fn degrade<T: Default>(metric: &str, reading: Result<T, String>) -> T {
    reading.unwrap_or_else(|e| {
        tracing::debug!("failed to collect {}: {}", metric, e);
        T::default()
    })
}

/// Thresholds exceeded by a sample.
pub fn check_thresholds(sample: &ResourceSample, thresholds: &ResourceThresholds) -> Vec<ResourceAlert> {
    let checks = [
        ("memory_percent", sample.memory_percent, thresholds.memory_percent),
        ("cpu_percent", sample.cpu_percent, thresholds.cpu_percent),
        ("open_files", sample.open_files as f64, thresholds.open_files as f64),
        (
            "network_connections",
            sample.network_connections as f64,
            thresholds.network_connections as f64,
        ),
    ];

    checks
        .into_iter()
        .filter(|(_, value, threshold)| value > threshold)
        .map(|(metric, value, threshold)| ResourceAlert {
            metric,
            value,
            threshold,
        })
        .collect()
}

/// Samples resource usage on an interval.
pub struct ResourceMonitor {
    inner: Arc<ResourceInner>,
    task: MonitorTask,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig, probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                config,
                probe: Mutex::new(probe),
                history: Mutex::new(BTreeMap::new()),
                latest: Mutex::new(None),
            }),
            task: MonitorTask::new("resource monitor"),
        }
    }

    pub fn config(&self) -> &ResourceMonitorConfig {
        &self.inner.config
    }

    /// Take one sample now and record it.
    pub fn sample_now(&self) -> ResourceSample {
        self.inner.sample()
    }

    /// Most recent sample, if any was taken.
    pub fn latest(&self) -> Option<ResourceSample> {
        self.inner.latest.lock().clone()
    }

    /// Start periodic sampling. Probes run on the blocking pool.
    pub fn start_monitoring(&self) -> Result<(), MonitorError> {
        let inner = self.inner.clone();
        self.task.start(self.inner.config.monitoring_interval, move || {
            let inner = inner.clone();
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || inner.sample()).await {
                    tracing::error!("resource sample aborted: {}", e);
                }
            }
        })
    }

    pub async fn stop_monitoring(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_monitoring(&self) -> bool {
        self.task.is_running()
    }

    /// `{current, avg, max, min}` per metric over the retained history.
    pub fn get_resource_stats(&self) -> ResourceStats {
        let history = self.inner.history.lock();
        history
            .iter()
            .filter_map(|(metric, series)| {
                let current = *series.back()?;
                let (mut sum, mut max, mut min) = (0.0, f64::MIN, f64::MAX);
                for &v in series {
                    sum += v;
                    max = max.max(v);
                    min = min.min(v);
                }
                Some((
                    metric.to_string(),
                    MetricStats {
                        current,
                        avg: sum / series.len() as f64,
                        max,
                        min,
                    },
                ))
            })
            .collect()
    }

    /// Number of samples retained for a metric.
    pub fn history_len(&self, metric: &str) -> usize {
        self.inner.history.lock().get(metric).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    /// Replays scripted readings; `None` simulates a collection failure.
    struct ScriptedProbe {
        cpu: VecDeque<Option<f64>>,
        memory: f64,
        open_files: Option<u64>,
    }

    impl ScriptedProbe {
        fn new(cpu: Vec<Option<f64>>, memory: f64) -> Self {
            Self {
                cpu: cpu.into(),
                memory,
                open_files: Some(12),
            }
        }
    }

    impl ResourceProbe for ScriptedProbe {
        fn cpu_percent(&mut self) -> Result<f64, String> {
            self.cpu
                .pop_front()
                .flatten()
                .ok_or_else(|| "cpu unavailable".to_string())
        }

        fn memory_percent(&mut self) -> Result<f64, String> {
            Ok(self.memory)
        }

        fn process_memory(&mut self) -> Result<(u64, u64), String> {
            Ok((1024, 4096))
        }

        fn open_files(&mut self) -> Result<u64, String> {
            self.open_files.ok_or_else(|| "no procfs".to_string())
        }

        fn network_connections(&mut self) -> Result<u64, String> {
            Ok(3)
        }
    }

    fn monitor(probe: ScriptedProbe, history_size: usize) -> ResourceMonitor {
        ResourceMonitor::new(
            ResourceMonitorConfig {
                monitoring_interval: Duration::from_millis(10),
                history_size,
                ..Default::default()
            },
            Box::new(probe),
        )
    }

    #[test]
    fn test_thresholds_default() {
        let t = ResourceThresholds::default();
        assert_eq!(t.memory_percent, 85.0);
        assert_eq!(t.cpu_percent, 80.0);
        assert_eq!(t.open_files, 1000);
        assert_eq!(t.network_connections, 500);
    }

    #[test]
    fn test_stats_over_history() {
        let rm = monitor(ScriptedProbe::new(vec![Some(10.0), Some(30.0), Some(20.0)], 40.0), 100);
        for _ in 0..3 {
            rm.sample_now();
        }

        let stats = rm.get_resource_stats();
        let cpu = stats["cpu_percent"];
        assert_eq!(cpu.current, 20.0);
        assert_eq!(cpu.max, 30.0);
        assert_eq!(cpu.min, 10.0);
        assert!((cpu.avg - 20.0).abs() < 1e-9);

        assert_eq!(stats["process_rss"].current, 1024.0);
        assert_eq!(stats["open_files"].current, 12.0);
        assert_eq!(stats.len(), 6);
    }

    #[test]
    fn test_history_is_bounded() {
        let rm = monitor(ScriptedProbe::new(vec![Some(1.0); 10], 40.0), 4);
        for _ in 0..10 {
            rm.sample_now();
        }
        assert_eq!(rm.history_len("cpu_percent"), 4);
        assert_eq!(rm.history_len("memory_percent"), 4);
    }

    #[test]
    fn test_failed_metric_degrades_to_zero() {
        let mut probe = ScriptedProbe::new(vec![None], 40.0);
        probe.open_files = None;
        let rm = monitor(probe, 100);

        let sample = rm.sample_now();
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.open_files, 0);
        assert_eq!(sample.memory_percent, 40.0);
        assert_eq!(sample.network_connections, 3);
        assert_eq!(rm.latest(), Some(sample));
    }

    #[test]
    fn test_check_thresholds() {
        let sample = ResourceSample {
            cpu_percent: 95.0,
            memory_percent: 85.0,
            open_files: 2000,
            network_connections: 10,
            ..Default::default()
        };
        let alerts = check_thresholds(&sample, &ResourceThresholds::default());
        let metrics: Vec<_> = alerts.iter().map(|a| a.metric).collect();
        assert_eq!(metrics, vec!["cpu_percent", "open_files"]);
    }

    #[test]
    #[traced_test]
    fn test_breach_logs_warning() {
        let rm = monitor(ScriptedProbe::new(vec![Some(5.0)], 97.0), 100);
        rm.sample_now();
        assert!(logs_contain("resource threshold exceeded: memory_percent"));
        assert!(!logs_contain("resource threshold exceeded: cpu_percent"));
    }

    #[test]
    fn test_empty_stats() {
        let rm = monitor(ScriptedProbe::new(vec![], 0.0), 100);
        assert!(rm.get_resource_stats().is_empty());
        assert!(rm.latest().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_sampling() {
        let rm = monitor(ScriptedProbe::new(vec![Some(1.0); 100], 10.0), 100);
        rm.start_monitoring().unwrap();
        assert!(rm.is_monitoring());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rm.stop_monitoring().await);
        assert!(!rm.is_monitoring());
        assert!(rm.history_len("cpu_percent") >= 2);
    }
}

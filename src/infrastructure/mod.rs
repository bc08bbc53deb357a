//! Infrastructure Layer
//!
//! The pool manager and the resilience and monitoring components behind it.

pub mod backoff;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod health_monitor;
pub mod leak_detector;
pub mod monitor_task;
pub mod pooled_session;
pub mod resource_monitor;
pub mod shutdown;

pub use backoff::{BackoffCalculator, BackoffConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection_pool::{
    ConnectionPoolManager, MonitoringStatus, PoolError, PoolManagerConfig, PoolMetrics, PoolSnapshot,
};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig, HealthSnapshot};
pub use leak_detector::{CleanupHook, LeakDetector, LeakDetectorConfig, LeakStats};
pub use monitor_task::MonitorTask;
pub use pooled_session::{PooledSession, RetryPolicy, SessionInfo, SessionOptions};
pub use resource_monitor::{
    MetricStats, ResourceMonitor, ResourceMonitorConfig, ResourceSample, ResourceStats, ResourceThresholds,
};
pub use shutdown::{shutdown_signal, ShutdownController};

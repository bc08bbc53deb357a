//! relay-pool Library
//!
//! Resilient outbound connection pools: named HTTP sessions guarded by
//! circuit breakers and backoff retries, watched by health, leak and
//! resource monitors, and exposed through a monitoring API.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::{load_config, Config, ConfigError};
pub use domain::entities::{ConnectionLeak, ConnectionState, HealthMetrics};
pub use domain::errors::{CallError, CircuitOpenError, MonitorError, RegistrationError};
pub use domain::ports::{health_check_fn, HealthCheck, ResourceProbe};
pub use infrastructure::{
    BackoffCalculator, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ConnectionPoolManager, HealthMonitor, LeakDetector, PoolError, PoolManagerConfig, PooledSession,
    ResourceMonitor,
};

use crate::infrastructure::{
    BackoffConfig, CircuitBreakerConfig, HealthMonitorConfig, LeakDetectorConfig, PoolManagerConfig,
    ResourceMonitorConfig, ResourceThresholds, SessionOptions,
};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Monitoring API
    pub api_listen_addr: String,
    pub debug: bool,

    // Health monitor
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,

    // Leak detector
    pub enable_leak_detection: bool,
    pub leak_cleanup_interval_secs: u64,
    pub leak_max_idle_secs: u64,

    // Resource monitor
    pub resource_monitoring_interval_secs: u64,
    pub memory_threshold_percent: f64,
    pub cpu_threshold_percent: f64,
    pub open_files_threshold: u64,
    pub network_connections_threshold: u64,

    // Pool defaults
    pub pool_maxsize: usize,
    pub max_retries: u32,
    pub enable_keep_alive: bool,

    // Backoff
    pub backoff_base_delay_ms: u64,
    pub backoff_max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: bool,

    // Circuit breaker
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,

    // Idle pool sweep run by the host process
    pub idle_pool_timeout_secs: u64,
    pub idle_pool_sweep_secs: u64,

    // Upstreams
    pub messaging_api_url: Option<String>,
    pub ai_api_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_listen_addr: "0.0.0.0:8090".to_string(),
            debug: false,
            health_check_interval_secs: 30,
            health_check_timeout_secs: 5,
            enable_leak_detection: true,
            leak_cleanup_interval_secs: 300,
            leak_max_idle_secs: 3600,
            resource_monitoring_interval_secs: 60,
            memory_threshold_percent: 85.0,
            cpu_threshold_percent: 80.0,
            open_files_threshold: 1000,
            network_connections_threshold: 500,
            pool_maxsize: 20,
            max_retries: 3,
            enable_keep_alive: true,
            backoff_base_delay_ms: 1000,
            backoff_max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            backoff_jitter: true,
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 3,
            idle_pool_timeout_secs: 1800,
            idle_pool_sweep_secs: 300,
            messaging_api_url: None,
            ai_api_url: None,
        }
    }
}

impl Config {
    /// Reject settings the monitors cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("health_check_timeout_secs", self.health_check_timeout_secs),
            ("leak_cleanup_interval_secs", self.leak_cleanup_interval_secs),
            ("resource_monitoring_interval_secs", self.resource_monitoring_interval_secs),
            ("idle_pool_sweep_secs", self.idle_pool_sweep_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("failure_threshold"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("success_threshold"));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.backoff_base_delay_ms > self.backoff_max_delay_ms {
            return Err(ConfigError::BackoffRange {
                base_ms: self.backoff_base_delay_ms,
                max_ms: self.backoff_max_delay_ms,
            });
        }
        for (name, pct) in [
            ("memory_threshold_percent", self.memory_threshold_percent),
            ("cpu_threshold_percent", self.cpu_threshold_percent),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ConfigError::PercentOutOfRange(name, pct));
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.backoff_base_delay_ms),
            max_delay: Duration::from_millis(self.backoff_max_delay_ms),
            multiplier: self.backoff_multiplier,
            jitter: self.backoff_jitter,
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            success_threshold: self.success_threshold,
        }
    }

    pub fn health_monitor(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            check_interval: Duration::from_secs(self.health_check_interval_secs),
            probe_timeout: Duration::from_secs(self.health_check_timeout_secs),
            circuit_breaker: self.circuit_breaker(),
            ..Default::default()
        }
    }

    pub fn leak_detector(&self) -> LeakDetectorConfig {
        LeakDetectorConfig {
            cleanup_interval: Duration::from_secs(self.leak_cleanup_interval_secs),
            max_idle_time: Duration::from_secs(self.leak_max_idle_secs),
        }
    }

    pub fn resource_monitor(&self) -> ResourceMonitorConfig {
        ResourceMonitorConfig {
            monitoring_interval: Duration::from_secs(self.resource_monitoring_interval_secs),
            thresholds: ResourceThresholds {
                memory_percent: self.memory_threshold_percent,
                cpu_percent: self.cpu_threshold_percent,
                open_files: self.open_files_threshold,
                network_connections: self.network_connections_threshold,
            },
            ..Default::default()
        }
    }

    pub fn session(&self) -> SessionOptions {
        SessionOptions {
            pool_maxsize: self.pool_maxsize,
            max_retries: self.max_retries,
            enable_keep_alive: self.enable_keep_alive,
            ..Default::default()
        }
    }

    pub fn pool_manager(&self) -> PoolManagerConfig {
        PoolManagerConfig {
            health: self.health_monitor(),
            enable_leak_detection: self.enable_leak_detection,
            leak: self.leak_detector(),
            resource: self.resource_monitor(),
            backoff: self.backoff(),
            session: self.session(),
        }
    }

    pub fn idle_pool_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_pool_timeout_secs)
    }

    pub fn idle_pool_sweep(&self) -> Duration {
        Duration::from_secs(self.idle_pool_sweep_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("{0} must be at least 1")]
    ZeroThreshold(&'static str),
    #[error("backoff multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("backoff base delay {base_ms}ms exceeds max delay {max_ms}ms")]
    BackoffRange { base_ms: u64, max_ms: u64 },
    #[error("{0} must be within 0..=100, got {1}")]
    PercentOutOfRange(&'static str, f64),
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let api_listen_addr = std::env::var("RELAY_POOL_API_LISTEN_ADDR")
        .unwrap_or_else(|_| defaults.api_listen_addr.clone());

    let debug = std::env::var("DEBUG").is_ok();

    // Health monitor
    let health_check_interval_secs = env_parse(
        "RELAY_POOL_HEALTH_CHECK_INTERVAL_SECS",
        defaults.health_check_interval_secs,
    );
    let health_check_timeout_secs = env_parse(
        "RELAY_POOL_HEALTH_CHECK_TIMEOUT_SECS",
        defaults.health_check_timeout_secs,
    );

    // Leak detector
    let enable_leak_detection = env_flag(
        "RELAY_POOL_ENABLE_LEAK_DETECTION",
        defaults.enable_leak_detection,
    );
    let leak_cleanup_interval_secs = env_parse(
        "RELAY_POOL_LEAK_CLEANUP_INTERVAL_SECS",
        defaults.leak_cleanup_interval_secs,
    );
    let leak_max_idle_secs = env_parse("RELAY_POOL_LEAK_MAX_IDLE_SECS", defaults.leak_max_idle_secs);

    // Resource monitor
    let resource_monitoring_interval_secs = env_parse(
        "RELAY_POOL_RESOURCE_MONITORING_INTERVAL_SECS",
        defaults.resource_monitoring_interval_secs,
    );
    let memory_threshold_percent = env_parse(
        "RELAY_POOL_MEMORY_THRESHOLD_PERCENT",
        defaults.memory_threshold_percent,
    );
    let cpu_threshold_percent = env_parse(
        "RELAY_POOL_CPU_THRESHOLD_PERCENT",
        defaults.cpu_threshold_percent,
    );
    let open_files_threshold = env_parse(
        "RELAY_POOL_OPEN_FILES_THRESHOLD",
        defaults.open_files_threshold,
    );
    let network_connections_threshold = env_parse(
        "RELAY_POOL_NETWORK_CONNECTIONS_THRESHOLD",
        defaults.network_connections_threshold,
    );

    // Pool defaults
    let pool_maxsize = env_parse("RELAY_POOL_POOL_MAXSIZE", defaults.pool_maxsize);
    let max_retries = env_parse("RELAY_POOL_MAX_RETRIES", defaults.max_retries);
    let enable_keep_alive = env_flag("RELAY_POOL_ENABLE_KEEP_ALIVE", defaults.enable_keep_alive);

    // Backoff
    let backoff_base_delay_ms = env_parse(
        "RELAY_POOL_BACKOFF_BASE_DELAY_MS",
        defaults.backoff_base_delay_ms,
    );
    let backoff_max_delay_ms = env_parse(
        "RELAY_POOL_BACKOFF_MAX_DELAY_MS",
        defaults.backoff_max_delay_ms,
    );
    let backoff_multiplier = env_parse(
        "RELAY_POOL_BACKOFF_MULTIPLIER",
        defaults.backoff_multiplier,
    );
    let backoff_jitter = env_flag("RELAY_POOL_BACKOFF_JITTER", defaults.backoff_jitter);

    // Circuit breaker
    let failure_threshold = env_parse("RELAY_POOL_FAILURE_THRESHOLD", defaults.failure_threshold);
    let recovery_timeout_secs = env_parse(
        "RELAY_POOL_RECOVERY_TIMEOUT_SECS",
        defaults.recovery_timeout_secs,
    );
    let success_threshold = env_parse("RELAY_POOL_SUCCESS_THRESHOLD", defaults.success_threshold);

    // Idle pool sweep
    let idle_pool_timeout_secs = env_parse(
        "RELAY_POOL_IDLE_POOL_TIMEOUT_SECS",
        defaults.idle_pool_timeout_secs,
    );
    let idle_pool_sweep_secs = env_parse(
        "RELAY_POOL_IDLE_POOL_SWEEP_SECS",
        defaults.idle_pool_sweep_secs,
    );

    // Upstreams
    let messaging_api_url = std::env::var("RELAY_POOL_MESSAGING_API_URL").ok();
    let ai_api_url = std::env::var("RELAY_POOL_AI_API_URL").ok();

    Ok(Config {
        api_listen_addr,
        debug,
        health_check_interval_secs,
        health_check_timeout_secs,
        enable_leak_detection,
        leak_cleanup_interval_secs,
        leak_max_idle_secs,
        resource_monitoring_interval_secs,
        memory_threshold_percent,
        cpu_threshold_percent,
        open_files_threshold,
        network_connections_threshold,
        pool_maxsize,
        max_retries,
        enable_keep_alive,
        backoff_base_delay_ms,
        backoff_max_delay_ms,
        backoff_multiplier,
        backoff_jitter,
        failure_threshold,
        recovery_timeout_secs,
        success_threshold,
        idle_pool_timeout_secs,
        idle_pool_sweep_secs,
        messaging_api_url,
        ai_api_url,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.api_listen_addr, "0.0.0.0:8090");
        assert_eq!(cfg.health_check_interval_secs, 30);
        assert!(cfg.enable_leak_detection);
        assert_eq!(cfg.leak_max_idle_secs, 3600);
        assert_eq!(cfg.pool_maxsize, 20);
        assert!(cfg.messaging_api_url.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load_config().unwrap();
        assert_eq!(cfg.leak_cleanup_interval_secs, 300);
        assert_eq!(cfg.open_files_threshold, 1000);
        assert_eq!(cfg.success_threshold, 3);
        assert!(cfg.ai_api_url.is_none());
    }

    #[test]
    fn test_sub_configs() {
        let cfg = Config::default();

        let backoff = cfg.backoff();
        assert_eq!(backoff.base_delay, Duration::from_secs(1));
        assert_eq!(backoff.max_delay, Duration::from_secs(60));
        assert!(backoff.jitter);

        let breaker = cfg.circuit_breaker();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(60));

        let resource = cfg.resource_monitor();
        assert_eq!(resource.thresholds.memory_percent, 85.0);
        assert_eq!(resource.thresholds.network_connections, 500);
        assert_eq!(resource.history_size, 100);

        let manager = cfg.pool_manager();
        assert!(manager.enable_leak_detection);
        assert_eq!(manager.health.probe_timeout, Duration::from_secs(5));
        assert_eq!(manager.leak.cleanup_interval, Duration::from_secs(300));
        assert_eq!(manager.session.max_retries, 3);
        assert_eq!(cfg.idle_pool_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_load_config_with_leak_detection_disabled() {
        std::env::set_var("RELAY_POOL_ENABLE_LEAK_DETECTION", "false");
        let cfg = load_config().unwrap();
        assert!(!cfg.enable_leak_detection);
        std::env::remove_var("RELAY_POOL_ENABLE_LEAK_DETECTION");
    }

    #[test]
    fn test_load_config_with_keep_alive_flag_1() {
        std::env::set_var("RELAY_POOL_BACKOFF_JITTER", "0");
        std::env::set_var("RELAY_POOL_ENABLE_KEEP_ALIVE", "TRUE");
        let cfg = load_config().unwrap();
        assert!(!cfg.backoff_jitter);
        assert!(cfg.enable_keep_alive);
        std::env::remove_var("RELAY_POOL_BACKOFF_JITTER");
        std::env::remove_var("RELAY_POOL_ENABLE_KEEP_ALIVE");
    }

    #[test]
    fn test_load_config_with_numbers() {
        std::env::set_var("RELAY_POOL_POOL_MAXSIZE", "8");
        std::env::set_var("RELAY_POOL_BACKOFF_MULTIPLIER", "1.5");
        std::env::set_var("RELAY_POOL_CPU_THRESHOLD_PERCENT", "92.5");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.pool_maxsize, 8);
        assert_eq!(cfg.backoff_multiplier, 1.5);
        assert_eq!(cfg.cpu_threshold_percent, 92.5);
        std::env::remove_var("RELAY_POOL_POOL_MAXSIZE");
        std::env::remove_var("RELAY_POOL_BACKOFF_MULTIPLIER");
        std::env::remove_var("RELAY_POOL_CPU_THRESHOLD_PERCENT");
    }

    #[test]
    fn test_load_config_invalid_number_falls_back() {
        std::env::set_var("RELAY_POOL_MAX_RETRIES", "lots");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.max_retries, 3);
        std::env::remove_var("RELAY_POOL_MAX_RETRIES");
    }

    #[test]
    fn test_load_config_upstreams() {
        std::env::set_var("RELAY_POOL_MESSAGING_API_URL", "https://api.line.me/");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.messaging_api_url.as_deref(), Some("https://api.line.me/"));
        std::env::remove_var("RELAY_POOL_MESSAGING_API_URL");
    }

    #[test]
    fn test_validate_zero_interval() {
        let cfg = Config {
            health_check_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroInterval("health_check_interval_secs"))
        );
    }

    #[test]
    fn test_validate_thresholds_and_backoff() {
        let cfg = Config {
            failure_threshold: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroThreshold("failure_threshold")));

        let cfg = Config {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMultiplier(_))));

        let cfg = Config {
            backoff_base_delay_ms: 5000,
            backoff_max_delay_ms: 10,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::BackoffRange { .. })));

        let cfg = Config {
            memory_threshold_percent: 120.0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PercentOutOfRange("memory_threshold_percent", _))
        ));
    }

    #[test]
    fn test_config_clone() {
        let cfg = Config::default();
        let cloned = cfg.clone();
        assert_eq!(cfg.api_listen_addr, cloned.api_listen_addr);
    }
}

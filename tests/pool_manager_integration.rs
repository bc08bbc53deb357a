//! Integration tests for the pool manager with Wiremock upstreams
//!
//! Exercises pooled sessions, health probing, retries and lifecycle against
//! mock messaging/AI servers.

use relay_pool::adapters::outbound::SysinfoResourceProbe;
use relay_pool::{
    health_check_fn, BackoffCalculator, BackoffConfig, CallError, CircuitBreakerConfig, CircuitState,
    ConnectionPoolManager, ConnectionState, PoolError, PoolManagerConfig,
};
use relay_pool::infrastructure::HealthMonitorConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_backoff() -> BackoffCalculator {
    BackoffCalculator::new(BackoffConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
        jitter: false,
    })
}

fn config(failure_threshold: u32) -> PoolManagerConfig {
    PoolManagerConfig {
        health: HealthMonitorConfig {
            check_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(500),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            ..Default::default()
        },
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: false,
        },
        ..Default::default()
    }
}

fn manager(failure_threshold: u32) -> ConnectionPoolManager {
    ConnectionPoolManager::new(config(failure_threshold), Box::new(SysinfoResourceProbe::new()))
}

/// Probe failures mark the pool unhealthy; recovery marks it healthy again
#[tokio::test]
async fn test_probe_tracks_upstream_health() {
    let upstream = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&upstream)
        .await;

    let m = manager(5);
    m.create_session("ai", Some(&upstream.uri())).unwrap();

    assert_eq!(m.health_monitor().check_all().await, 1);
    assert!(!m.is_connection_healthy("ai"));
    let metrics = m.health_monitor().get_metrics("ai").unwrap().metrics;
    assert_eq!(metrics.failure_count, 1);
    assert_eq!(metrics.state, ConnectionState::Unhealthy);

    upstream.reset().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    assert_eq!(m.health_monitor().check_all().await, 0);
    let metrics = m.health_monitor().get_metrics("ai").unwrap().metrics;
    assert_eq!(metrics.success_count, 1);
    assert!(m.is_connection_healthy("ai"));
}

/// Background probing runs against the upstream without explicit calls
#[tokio::test]
async fn test_background_probe_loop() {
    let upstream = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let m = manager(5);
    m.create_session("messaging", Some(&upstream.uri())).unwrap();
    assert!(m.start_monitoring().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    m.cleanup_pools().await;

    assert!(!upstream.received_requests().await.unwrap().is_empty());
    assert!(!m.is_monitoring().any());
}

/// Work routed through execute_with_retry survives transient upstream errors
#[tokio::test]
async fn test_execute_with_retry_over_session() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/bot/message/reply"))
        .respond_with(ResponseTemplate::new(400))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/bot/message/reply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sent": true})))
        .mount(&upstream)
        .await;

    let m = manager(5);
    let session = m.create_session("messaging", Some(&upstream.uri())).unwrap();

    let result = m
        .execute_with_retry(
            "messaging",
            || {
                let session = session.clone();
                async move {
                    let response = session
                        .post_json("/v2/bot/message/reply", &serde_json::json!({"text": "hi"}))
                        .await?;
                    let response = response.error_for_status()?;
                    let body: serde_json::Value = response.json().await?;
                    Ok::<_, PoolError>(body)
                }
            },
            3,
            Some(&fast_backoff()),
        )
        .await;

    assert_eq!(result.unwrap()["sent"], true);
    let metrics = m.health_monitor().get_metrics("messaging").unwrap().metrics;
    assert_eq!(metrics.failure_count, 1);
    assert_eq!(metrics.success_count, 1);
    assert!(metrics.total_bytes_sent > 0);
    assert_eq!(m.pools()["messaging"].request_count, 1);
}

/// svc: three failures with threshold 3 re-raise the original error and open the circuit
#[tokio::test]
async fn test_always_failing_call_opens_circuit() {
    let m = manager(3);
    m.health_monitor()
        .register_connection("svc", health_check_fn(|| async { Ok::<(), String>(()) }), 3)
        .unwrap();

    let invoked = AtomicU32::new(0);
    let counter = &invoked;
    let result = m
        .execute_with_retry(
            "svc",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("upstream exploded".to_string())
            },
            3,
            Some(&fast_backoff()),
        )
        .await;

    assert_eq!(
        result.unwrap_err().into_failure(),
        Some("upstream exploded".to_string())
    );
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    let snapshot = m.health_monitor().get_metrics("svc").unwrap();
    assert_eq!(snapshot.metrics.failure_count, 3);
    assert_eq!(snapshot.circuit_state, CircuitState::Open);
    assert_eq!(snapshot.metrics.state, ConnectionState::CircuitOpen);
    assert!(snapshot.metrics.circuit_open_until.is_some());

    // Next call is rejected without running the work
    let rejected = m
        .execute_with_retry(
            "svc",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            },
            3,
            None,
        )
        .await;
    assert!(matches!(rejected, Err(CallError::CircuitOpen(_))));
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
    assert!(!m.is_connection_healthy("svc"));
}

/// Concurrent callers are each counted exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_are_counted_once() {
    let m = manager(5);
    m.create_session("ai", None).unwrap();

    let calls = (0..25).map(|i| {
        m.execute_with_retry(
            "ai",
            move || async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok::<u32, String>(i)
            },
            2,
            None,
        )
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let metrics = m.health_monitor().get_metrics("ai").unwrap().metrics;
    assert_eq!(metrics.success_count, 25);
    assert_eq!(metrics.active_connections, 0);
    assert!(metrics.peak_connections >= 1);
    assert_eq!(m.pools()["ai"].request_count, 25);
}

/// Two pools, then cleanup: registry empty and every loop stopped
#[tokio::test]
async fn test_two_pools_then_cleanup() {
    let m = manager(5);
    let a = m.create_session("a", None).unwrap();
    let b = m.create_session("b", None).unwrap();
    assert!(m.start_monitoring().is_empty());
    assert_eq!(m.get_metrics().total_pools, 2);

    m.cleanup_pools().await;

    assert_eq!(m.get_metrics().total_pools, 0);
    let status = m.is_monitoring();
    assert!(!status.health && !status.leak_detection && !status.resources);
    assert!(a.is_closed() && b.is_closed());

    // Leak records outlive their pools
    let stats = m.get_leak_stats().unwrap();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 0);

    m.cleanup_pools().await;
    assert_eq!(m.pool_count(), 0);
}

/// Unknown names leave the registry alone
#[tokio::test]
async fn test_force_cleanup_unknown_leaves_registry() {
    let m = manager(5);
    m.create_session("a", None).unwrap();
    assert!(!m.force_cleanup_connection("b"));
    assert_eq!(m.pool_names(), vec!["a".to_string()]);
}

/// Only pools idle past the threshold are removed
#[tokio::test]
async fn test_cleanup_idle_keeps_recently_used() {
    let m = manager(5);
    m.create_session("used", None).unwrap();
    m.create_session("idle", None).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    m.execute_with_retry("used", || async { Ok::<(), String>(()) }, 1, None)
        .await
        .unwrap();

    assert_eq!(m.cleanup_idle_connections(Duration::from_millis(40)), 1);
    assert_eq!(m.pool_names(), vec!["used".to_string()]);
}

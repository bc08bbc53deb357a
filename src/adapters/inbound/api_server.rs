//! Monitoring API Server
//!
//! Read-only dashboard feed for the pool manager plus a few operator
//! actions: reset a breaker, drop a pool, sweep idle pools.

use crate::infrastructure::{ConnectionPoolManager, ShutdownController};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    manager: Arc<ConnectionPoolManager>,
    /// Used by cleanup-idle when the caller gives no threshold
    default_idle_timeout: Duration,
}

impl ApiState {
    pub fn new(manager: Arc<ConnectionPoolManager>, default_idle_timeout: Duration) -> Self {
        Self {
            manager,
            default_idle_timeout,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.manager
    }
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub total_pools: usize,
}

/// Query for the idle sweep endpoint.
#[derive(Debug, Deserialize)]
pub struct CleanupIdleParams {
    pub max_idle_secs: Option<u64>,
}

/// HTTP front for pool metrics.
pub struct MonitoringApi {
    listen_addr: String,
    state: ApiState,
}

impl MonitoringApi {
    pub fn new(listen_addr: String, state: ApiState) -> Self {
        Self { listen_addr, state }
    }

    pub fn state(&self) -> ApiState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("monitoring API listening on {}", self.listen_addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;
        tracing::info!("monitoring API stopped");
        Ok(())
    }
}

/// Build the monitoring router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/connections/metrics", get(metrics_handler))
        .route("/api/v1/connections/leaks", get(leaks_handler))
        .route("/api/v1/connections/cleanup-idle", post(cleanup_idle_handler))
        .route("/api/v1/connections/:name/health", get(connection_health_handler))
        .route("/api/v1/connections/:name/reset", post(reset_handler))
        .route("/api/v1/connections/:name", delete(cleanup_handler))
        .layer(TraceLayer::new_for_http())
        // Browser dashboards may read, not act
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([axum::http::Method::GET]),
        )
        .with_state(state)
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        total_pools: state.manager.pool_count(),
    })
}

async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.manager.get_metrics())
}

async fn leaks_handler(State(state): State<ApiState>) -> Response {
    match state.manager.get_leak_stats() {
        Some(stats) => Json(stats).into_response(),
        None => Json(serde_json::json!({ "enabled": false })).into_response(),
    }
}

async fn connection_health_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.health_monitor().get_metrics(&name) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found(&name),
    }
}

async fn reset_handler(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    if state.manager.reset_circuit(&name) {
        Json(serde_json::json!({
            "name": name,
            "circuit_state": state.manager.circuit_state(&name),
        }))
        .into_response()
    } else {
        not_found(&name)
    }
}

async fn cleanup_handler(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    if state.manager.force_cleanup_connection(&name) {
        Json(serde_json::json!({
            "name": name,
            "removed": true,
        }))
        .into_response()
    } else {
        not_found(&name)
    }
}

async fn cleanup_idle_handler(
    State(state): State<ApiState>,
    Query(params): Query<CleanupIdleParams>,
) -> impl IntoResponse {
    let max_idle = params
        .max_idle_secs
        .map(Duration::from_secs)
        .unwrap_or(state.default_idle_timeout);
    let removed = state.manager.cleanup_idle_connections(max_idle);
    Json(serde_json::json!({
        "removed": removed,
        "max_idle_secs": max_idle.as_secs(),
    }))
}

fn not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "name": name,
            "error": "connection not found"
        })),
    )
        .into_response()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceProbe;
    use crate::infrastructure::PoolManagerConfig;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoProbe;

    impl ResourceProbe for NoProbe {
        fn cpu_percent(&mut self) -> Result<f64, String> {
            Err("n/a".to_string())
        }
        fn memory_percent(&mut self) -> Result<f64, String> {
            Err("n/a".to_string())
        }
        fn process_memory(&mut self) -> Result<(u64, u64), String> {
            Err("n/a".to_string())
        }
        fn open_files(&mut self) -> Result<u64, String> {
            Err("n/a".to_string())
        }
        fn network_connections(&mut self) -> Result<u64, String> {
            Err("n/a".to_string())
        }
    }

    fn state_with(config: PoolManagerConfig) -> ApiState {
        let manager = Arc::new(ConnectionPoolManager::new(config, Box::new(NoProbe)));
        ApiState::new(manager, Duration::from_secs(1800))
    }

    fn state() -> ApiState {
        state_with(PoolManagerConfig::default())
    }

    async fn call(state: &ApiState, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = state();
        state.manager().create_session("ai", None).unwrap();

        let (status, body) = call(&state, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["total_pools"], 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = state();
        state.manager().create_session("messaging", None).unwrap();
        state.manager().resource_monitor().sample_now();

        let (status, body) = call(&state, Method::GET, "/api/v1/connections/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_pools"], 1);
        assert!(body["pools"]["messaging"]["connection_id"].is_string());
        assert_eq!(body["pools"]["messaging"]["closed"], false);
        assert_eq!(body["health_metrics"]["messaging"]["success_count"], 0);
        assert_eq!(body["leak_stats"]["total_connections"], 1);
        // Failed probes degrade to zero instead of failing the endpoint
        assert_eq!(body["resource_stats"]["cpu_percent"]["current"], 0.0);
    }

    #[tokio::test]
    async fn test_leaks_endpoint_disabled() {
        let state = state_with(PoolManagerConfig {
            enable_leak_detection: false,
            ..Default::default()
        });
        let (status, body) = call(&state, Method::GET, "/api/v1/connections/leaks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "enabled": false }));
    }

    #[tokio::test]
    async fn test_leaks_endpoint_enabled() {
        let state = state();
        state.manager().create_session("ai", None).unwrap();
        let (_, body) = call(&state, Method::GET, "/api/v1/connections/leaks").await;
        assert_eq!(body["active_connections"], 1);
        assert_eq!(body["leaks_detected"], 0);
    }

    #[tokio::test]
    async fn test_connection_health_endpoint() {
        let state = state();
        state.manager().create_session("ai", None).unwrap();

        let (status, body) = call(&state, Method::GET, "/api/v1/connections/ai/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "healthy");
        assert_eq!(body["circuit_state"], "closed");

        let (status, body) = call(&state, Method::GET, "/api/v1/connections/nope/health").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "connection not found");
    }

    #[tokio::test]
    async fn test_reset_endpoint() {
        let state = state();
        state.manager().create_session("ai", None).unwrap();

        let (status, body) = call(&state, Method::POST, "/api/v1/connections/ai/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["circuit_state"], "closed");

        let (status, _) = call(&state, Method::POST, "/api/v1/connections/nope/reset").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_endpoint() {
        let state = state();
        state.manager().create_session("ai", None).unwrap();

        let (status, body) = call(&state, Method::DELETE, "/api/v1/connections/ai").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);
        assert_eq!(state.manager().pool_count(), 0);

        let (status, _) = call(&state, Method::DELETE, "/api/v1/connections/ai").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cleanup_idle_endpoint() {
        let state = state();
        state.manager().create_session("old", None).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        state.manager().create_session("new", None).unwrap();

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/connections/cleanup-idle?max_idle_secs=1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
        assert_eq!(state.manager().pool_names(), vec!["new".to_string()]);

        // Default threshold keeps everything
        let (_, body) = call(&state, Method::POST, "/api/v1/connections/cleanup-idle").await;
        assert_eq!(body["removed"], 0);
        assert_eq!(body["max_idle_secs"], 1800);
    }
}

//! relay-pool - Resilient outbound connection pools for the chat relay
//!
//! This is the composition root that wires together all the components.

use relay_pool::adapters::inbound::{ApiState, MonitoringApi};
use relay_pool::adapters::outbound::SysinfoResourceProbe;
use relay_pool::config::load_config;
use relay_pool::infrastructure::{shutdown_signal, ConnectionPoolManager, ShutdownController};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;
    cfg.validate()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting relay-pool api={} leak_detection={}",
        cfg.api_listen_addr,
        cfg.enable_leak_detection
    );

    // ===== COMPOSITION ROOT =====

    // 1. Pool manager with the host resource probe
    let manager = Arc::new(ConnectionPoolManager::new(
        cfg.pool_manager(),
        Box::new(SysinfoResourceProbe::new()),
    ));

    // 2. Upstream pools
    for (name, url) in [
        ("messaging", cfg.messaging_api_url.as_deref()),
        ("ai", cfg.ai_api_url.as_deref()),
    ] {
        if let Err(e) = manager.create_session(name, url) {
            tracing::error!("failed to create pool {}: {}", name, e);
        }
    }

    // 3. Background monitors
    let failures = manager.start_monitoring();
    if !failures.is_empty() {
        tracing::warn!("{} monitors failed to start", failures.len());
    }

    // 4. Periodic idle-pool sweep
    let shutdown = ShutdownController::new();
    let sweep = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        let interval = cfg.idle_pool_sweep();
        let max_idle = cfg.idle_pool_timeout();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {
                        let removed = manager.cleanup_idle_connections(max_idle);
                        if removed > 0 {
                            tracing::info!("idle sweep removed {} pools", removed);
                        }
                    }
                }
            }
        })
    };

    // 5. Monitoring API until Ctrl+C / SIGTERM
    tokio::spawn(shutdown_signal(shutdown.clone()));
    let api = MonitoringApi::new(
        cfg.api_listen_addr.clone(),
        ApiState::new(manager.clone(), cfg.idle_pool_timeout()),
    );
    let served = api.run(shutdown.clone()).await;

    // 6. Teardown
    shutdown.shutdown();
    if let Err(e) = sweep.await {
        tracing::error!("idle sweep task failed: {}", e);
    }
    manager.cleanup_pools().await;
    tracing::info!("relay-pool stopped");

    served
}

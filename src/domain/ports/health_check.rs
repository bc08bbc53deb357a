//! Health Check Port
//!
//! Defines the probe the health monitor runs against each registered connection.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A lightweight reachability probe for one connection.
///
/// Implementations may perform network I/O. Errors are reported as strings
/// and are only ever logged and counted; they never stop the monitor.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// Adapter turning an async closure into a [`HealthCheck`].
pub struct FnHealthCheck<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    async fn check(&self) -> Result<(), String> {
        (self.f)().await
    }
}

/// Build a shareable probe from an async closure.
pub fn health_check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(FnHealthCheck { f })
}

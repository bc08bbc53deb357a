//! Pooled HTTP Session
//!
//! The reusable outbound handle handed out by the pool manager: a
//! `reqwest::Client` with a bounded idle pool, optional keep-alive, and a
//! status-aware retry policy.

use crate::domain::ports::HealthCheck;
use crate::infrastructure::backoff::BackoffCalculator;
use crate::infrastructure::connection_pool::PoolError;
use crate::infrastructure::health_monitor::HealthMonitor;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, CONNECTION};
use reqwest::{Client, Method, Request, Response, StatusCode, Url};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Statuses retried by default.
pub const RETRY_STATUS_FORCELIST: [u16; 5] = [429, 500, 502, 503, 504];

/// Per-session client options.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Idle connections kept per host. Busy pools dial extra connections.
    pub pool_maxsize: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub enable_keep_alive: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// TCP keep-alive probe interval when keep-alive is on
    pub keep_alive_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pool_maxsize: 20,
            max_retries: 3,
            enable_keep_alive: true,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(60),
        }
    }
}

/// Which requests are retried and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffCalculator,
    pub status_forcelist: Vec<StatusCode>,
    pub allowed_methods: Vec<Method>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffCalculator) -> Self {
        Self {
            max_retries,
            backoff,
            status_forcelist: RETRY_STATUS_FORCELIST
                .iter()
                .filter_map(|code| StatusCode::from_u16(*code).ok())
                .collect(),
            allowed_methods: vec![
                Method::HEAD,
                Method::GET,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
                Method::TRACE,
                Method::POST,
            ],
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.status_forcelist.contains(&status)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(SessionOptions::default().max_retries, BackoffCalculator::default())
    }
}

/// Serializable description of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub connection_id: String,
    pub base_url: Option<String>,
    pub pool_maxsize: usize,
    pub keep_alive: bool,
    pub closed: bool,
}

/// A named, pooled HTTP client.
pub struct PooledSession {
    name: String,
    connection_id: String,
    base_url: Option<Url>,
    options: SessionOptions,
    retry: RetryPolicy,
    client: RwLock<Option<Client>>,
    monitor: Weak<HealthMonitor>,
}

impl PooledSession {
    /// Build the session's client.
    ///
    /// `monitor` receives transfer byte counts; pass `Weak::new()` for none.
    pub fn new(
        name: &str,
        connection_id: &str,
        base_url: Option<Url>,
        options: SessionOptions,
        retry: RetryPolicy,
        monitor: Weak<HealthMonitor>,
    ) -> Result<Self, PoolError> {
        let client = build_client(&options)?;
        Ok(Self {
            name: name.to_string(),
            connection_id: connection_id.to_string(),
            base_url,
            options,
            retry,
            client: RwLock::new(Some(client)),
            monitor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_closed(&self) -> bool {
        self.client.read().is_none()
    }

    /// Drop the client and its idle connections. Returns false if already closed.
    pub fn close(&self) -> bool {
        let closed = self.client.write().take().is_some();
        if closed {
            tracing::debug!("closed session {} ({})", self.name, self.connection_id);
        }
        closed
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            connection_id: self.connection_id.clone(),
            base_url: self.base_url.as_ref().map(|u| u.to_string()),
            pool_maxsize: self.options.pool_maxsize,
            keep_alive: self.options.enable_keep_alive,
            closed: self.is_closed(),
        }
    }

    fn client(&self) -> Result<Client, PoolError> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| PoolError::SessionClosed(self.name.clone()))
    }

    /// Resolve `path` against the base URL. Absolute URLs pass through.
    pub fn url(&self, path: &str) -> Result<Url, PoolError> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| PoolError::InvalidUrl(format!("{} (session has no base url)", path)))?;
        base.join(path)
            .map_err(|e| PoolError::InvalidUrl(format!("{}: {}", path, e)))
    }

    pub async fn get(&self, path: &str) -> Result<Response, PoolError> {
        let request = self.client()?.get(self.url(path)?).build()?;
        self.send(request).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, PoolError> {
        let request = self.client()?.post(self.url(path)?).json(body).build()?;
        self.send(request).await
    }

    /// Execute a request under the retry policy.
    ///
    /// Transport errors and forcelisted statuses are retried for allowed
    /// methods. When retries run out a retryable status is returned as-is.
    /// Requests with streaming bodies cannot be replayed and are sent once.
    pub async fn send(&self, request: Request) -> Result<Response, PoolError> {
        let client = self.client()?;
        let retryable = self.retry.allows_method(request.method());
        let mut pending = request;
        let mut attempt = 0;

        loop {
            let replay = if retryable && attempt < self.retry.max_retries {
                pending.try_clone()
            } else {
                None
            };
            let sent = request_len(&pending);
            let url = pending.url().clone();

            match client.execute(pending).await {
                Ok(response) => {
                    self.report_transfer(sent, response.content_length().unwrap_or(0));
                    let status = response.status();
                    match replay {
                        Some(next) if self.retry.is_retryable_status(status) => {
                            let delay = self.retry.backoff.get_delay(attempt);
                            tracing::warn!(
                                "{} {} returned {}; retry {}/{} in {:?}",
                                self.name,
                                url,
                                status,
                                attempt + 1,
                                self.retry.max_retries,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            pending = next;
                        }
                        _ => return Ok(response),
                    }
                }
                Err(e) => {
                    self.report_transfer(sent, 0);
                    match replay {
                        Some(next) => {
                            let delay = self.retry.backoff.get_delay(attempt);
                            tracing::warn!(
                                "{} {} failed: {}; retry {}/{} in {:?}",
                                self.name,
                                url,
                                e,
                                attempt + 1,
                                self.retry.max_retries,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            pending = next;
                        }
                        None => return Err(PoolError::Request(e)),
                    }
                }
            }
            attempt += 1;
        }
    }

    fn report_transfer(&self, sent: u64, received: u64) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.record_transfer(&self.name, sent, received);
        }
    }

    /// Reachability probe: HEAD on the base URL, anything below 500 is up.
    ///
    /// Without a base URL the probe only checks that the session is open.
    pub async fn probe(&self) -> Result<(), String> {
        let client = self.client().map_err(|e| e.to_string())?;
        let Some(base) = &self.base_url else {
            return Ok(());
        };
        let response = client
            .head(base.clone())
            .send()
            .await
            .map_err(|e| format!("HEAD {} failed: {}", base, e))?;
        if response.status().is_server_error() {
            return Err(format!("HEAD {} returned {}", base, response.status()));
        }
        Ok(())
    }

    /// Health check that does not keep the session alive.
    pub fn health_check(self: &Arc<Self>) -> Arc<dyn HealthCheck> {
        Arc::new(SessionProbe {
            session: Arc::downgrade(self),
        })
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("name", &self.name)
            .field("connection_id", &self.connection_id)
            .field("base_url", &self.base_url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct SessionProbe {
    session: Weak<PooledSession>,
}

#[async_trait]
impl HealthCheck for SessionProbe {
    async fn check(&self) -> Result<(), String> {
        match self.session.upgrade() {
            Some(session) => session.probe().await,
            None => Err("session dropped".to_string()),
        }
    }
}

fn build_client(options: &SessionOptions) -> Result<Client, PoolError> {
    let mut builder = Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.request_timeout);

    builder = if options.enable_keep_alive {
        builder
            .pool_max_idle_per_host(options.pool_maxsize)
            .tcp_keepalive(Some(options.keep_alive_interval))
    } else {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        builder.pool_max_idle_per_host(0).default_headers(headers)
    };

    builder.build().map_err(PoolError::ClientBuild)
}

fn request_len(request: &Request) -> u64 {
    request
        .body()
        .and_then(|body| body.as_bytes())
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

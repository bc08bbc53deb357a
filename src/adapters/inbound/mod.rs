mod api_server;

pub use api_server::{router, ApiState, CleanupIdleParams, HealthResponse, MonitoringApi};

//! Domain Layer
//!
//! Bookkeeping records, shared errors, and the ports the monitors consume.

pub mod entities;
pub mod errors;
pub mod ports;

pub use entities::{ConnectionLeak, ConnectionState, HealthMetrics};
pub use errors::{CallError, CircuitOpenError, MonitorError, RegistrationError};
pub use ports::{HealthCheck, ResourceProbe};

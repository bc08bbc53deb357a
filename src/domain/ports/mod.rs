mod health_check;
mod resource_probe;

pub use health_check::{health_check_fn, FnHealthCheck, HealthCheck};
pub use resource_probe::ResourceProbe;

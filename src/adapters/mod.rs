//! Adapters
//!
//! Inbound: the monitoring HTTP API. Outbound: host resource probing.

pub mod inbound;
pub mod outbound;

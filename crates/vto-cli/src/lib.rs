//! Upload client for the virtual try-on endpoint.

pub mod client;
pub mod debug;

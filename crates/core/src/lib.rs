//! EdgeTunnel core utilities
//!
//! Ambient concerns shared by the relay library and the server binary:
//! tracing initialisation, process-wide metrics and configuration validation.

pub mod tracing;
pub mod validation;

pub use validation::{ValidateConfig, validators};

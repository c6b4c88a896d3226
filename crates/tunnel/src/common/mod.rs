//! Error taxonomy and API types shared across the crate
pub mod error;
pub mod types;

pub use error::{Result, TunnelError};
pub use types::*;

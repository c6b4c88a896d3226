//! Shared tracing functionality for EdgeTunnel

pub mod config;
pub mod init;
pub mod metrics;

pub use config::InstrumentationConfig;
pub use init::init_tracing;

pub mod prelude {
    pub use crate::tracing::metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

    // Re-export common tracing macros and types
    pub use ::tracing::{Instrument, debug, error, info, instrument, trace, warn};
}

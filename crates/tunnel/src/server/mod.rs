//! HTTP front end: tunnel endpoints, admin API and configuration

pub mod admin;
pub mod config;
pub mod router;
pub mod ws;

pub use config::EdgeTunnelConfig;
pub use router::{AppState, create_router};
pub use ws::WsStream;

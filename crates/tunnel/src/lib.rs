//! EdgeTunnel: VLESS and Trojan over WebSocket
//!
//! An inbound WebSocket is adapted to a byte stream, its first bytes are
//! parsed as a protocol header, the credential is checked against the node
//! registry and the remaining bytes are relayed to a TCP backend.
//!
//! - [`protocol`]: header framers for both protocols
//! - [`registry`]: node stores and the TTL cache
//! - [`auth`]: credential validation
//! - [`relay`]: the per-session state machine and byte pump
//! - [`server`]: axum routes, admin API and configuration

pub mod auth;
pub mod common;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;

pub use auth::Authenticator;
pub use common::error;
pub use error::{Result, TunnelError};

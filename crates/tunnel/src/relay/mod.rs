//! Tunnel relay: the lifecycle of one client channel
//!
//! ```text
//! AwaitingUpgrade -> HeaderPending -> Authenticating -> Dialing -> Relaying -> Closed
//!                          \________________\_______________\___________\-> Failed
//! ```
//!
//! The router performs the upgrade check ([`TunnelRelay::preflight`]) and
//! hands the upgraded byte stream to [`TunnelRelay::serve`].

pub mod channel;
pub mod dial;
pub mod pump;
pub mod session;

pub use channel::Channel;
pub use dial::{BackendPolicy, Dialer, TcpDialer};
pub use pump::{PumpOptions, TrafficCounters};
pub use session::{RelayConfig, SessionRequest, SessionState, SessionSummary, TunnelRelay};

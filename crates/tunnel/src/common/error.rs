//! Error types for the tunnel relay

use crate::protocol::Command;
use std::fmt;
use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors raised while parsing a connection-request header
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes are available than the header declares
    #[error("request header truncated")]
    Truncated,

    /// Structurally invalid header
    #[error("malformed request header: {0}")]
    Malformed(String),

    /// Version byte is not the supported value
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown address type
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
}

/// Authentication failures
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential missing, empty or not registered
    #[error("invalid credential")]
    Invalid,

    /// The node registry could not be read
    #[error("node registry unavailable: {0}")]
    StoreUnavailable(String),
}

/// Failures opening the backend connection
#[derive(Debug, Error)]
pub enum DialError {
    /// Backend actively refused or reset the connection
    #[error("connection to {target} refused: {reason}")]
    Refused { target: String, reason: String },

    /// Dial did not complete in time
    #[error("connection to {target} timed out")]
    Timeout { target: String },

    /// Host name did not resolve to any address
    #[error("could not resolve {target}: {reason}")]
    ResolutionFailed { target: String, reason: String },
}

/// Which end of a session an I/O failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Backend => f.write_str("backend"),
        }
    }
}

/// I/O failures while pumping bytes
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("read from {side} failed: {source}")]
    ReadFailed {
        side: Side,
        #[source]
        source: std::io::Error,
    },

    #[error("write to {side} failed: {source}")]
    WriteFailed {
        side: Side,
        #[source]
        source: std::io::Error,
    },
}

/// Node store failures
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Backing store cannot be read or written
    #[error("node store unavailable: {0}")]
    Unavailable(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    Duplicate(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RegistryError> for AuthError {
    fn from(e: RegistryError) -> Self {
        AuthError::StoreUnavailable(e.to_string())
    }
}

/// Errors that terminate a tunnel session
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The inbound request did not ask for a channel upgrade
    #[error("upgrade required")]
    UpgradeRequired,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Header did not complete within the configured window
    #[error("timed out waiting for request header")]
    HeaderTimeout,

    /// No bytes moved in either direction for the idle window
    #[error("session idle timeout")]
    IdleTimeout,

    /// Parsed command is valid on the wire but not relayed
    #[error("command not supported: {0}")]
    UnsupportedCommand(Command),

    /// No backend is configured and direct dialing is disabled
    #[error("no backend configured")]
    NoBackend,

    #[error("session cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Whether the client caused the failure (bad header or credential)
    ///
    /// Internal failures such as an unavailable store or a failed dial
    /// return false.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            TunnelError::UpgradeRequired
                | TunnelError::Frame(_)
                | TunnelError::Auth(AuthError::Invalid)
                | TunnelError::HeaderTimeout
                | TunnelError::UnsupportedCommand(_)
        )
    }

    /// Short stable label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::UpgradeRequired => "upgrade_required",
            TunnelError::Frame(FrameError::Truncated) => "frame_truncated",
            TunnelError::Frame(FrameError::Malformed(_)) => "frame_malformed",
            TunnelError::Frame(FrameError::UnsupportedVersion(_)) => "frame_unsupported_version",
            TunnelError::Frame(FrameError::UnsupportedAddressType(_)) => {
                "frame_unsupported_address_type"
            }
            TunnelError::Auth(AuthError::Invalid) => "auth_invalid",
            TunnelError::Auth(AuthError::StoreUnavailable(_)) => "auth_store_unavailable",
            TunnelError::Dial(DialError::Refused { .. }) => "dial_refused",
            TunnelError::Dial(DialError::Timeout { .. }) => "dial_timeout",
            TunnelError::Dial(DialError::ResolutionFailed { .. }) => "dial_resolution_failed",
            TunnelError::Relay(RelayError::ReadFailed { .. }) => "relay_read_failed",
            TunnelError::Relay(RelayError::WriteFailed { .. }) => "relay_write_failed",
            TunnelError::HeaderTimeout => "header_timeout",
            TunnelError::IdleTimeout => "idle_timeout",
            TunnelError::UnsupportedCommand(_) => "unsupported_command",
            TunnelError::NoBackend => "no_backend",
            TunnelError::Cancelled => "cancelled",
        }
    }
}

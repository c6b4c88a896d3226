//! Connection-request framing for the supported tunnel protocols
//!
//! Both protocols put a fixed-format request header in the very first bytes
//! of the channel. A framer must cope with a partial first read: it returns
//! [`FrameError::Truncated`] when more bytes could still complete the header,
//! and a structural error as soon as the bytes seen so far cannot.

pub mod address;
pub mod trojan;
pub mod vless;

pub use address::{Host, TargetAddr};
pub use trojan::Trojan;
pub use vless::Vless;

use crate::common::error::FrameError;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tunnel protocol selected by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// VLESS-style framing (protocol A)
    Vless,
    /// Trojan-style framing (protocol B)
    Trojan,
}

impl ProtocolKind {
    /// Framer implementing this protocol
    pub fn framer(self) -> &'static dyn Framer {
        match self {
            ProtocolKind::Vless => &Vless,
            ProtocolKind::Trojan => &Trojan,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Vless => "vless",
            ProtocolKind::Trojan => "trojan",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Associate,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => f.write_str("CONNECT"),
            Command::Associate => f.write_str("ASSOCIATE"),
        }
    }
}

/// Client credential, in the form the protocol carries it
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Raw 16-byte user id (VLESS)
    Uuid(Uuid),
    /// Lowercase hex SHA-224 of the password (Trojan)
    PasswordHash(String),
    /// Opaque token supplied out of band, e.g. a query parameter
    Token(String),
}

impl Credential {
    /// Short form safe to put in logs
    pub fn redacted(&self) -> String {
        let full = match self {
            Credential::Uuid(id) => id.to_string(),
            Credential::PasswordHash(hash) => hash.clone(),
            Credential::Token(token) => token.clone(),
        };
        let prefix: String = full.chars().take(8).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Uuid(_) => write!(f, "Uuid({})", self.redacted()),
            Credential::PasswordHash(_) => write!(f, "PasswordHash({})", self.redacted()),
            Credential::Token(_) => write!(f, "Token({})", self.redacted()),
        }
    }
}

/// Parsed connection-request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub protocol: ProtocolKind,
    pub credential: Credential,
    pub target: TargetAddr,
    pub command: Command,
    /// Application bytes that arrived in the same read as the header
    ///
    /// These must reach the backend before anything read afterwards.
    pub leftover: Bytes,
}

/// Parses and produces one protocol's connection-request header
pub trait Framer: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Parse a header from the start of `buf`
    ///
    /// Bytes after the header are returned in
    /// [`ConnectionRequest::leftover`].
    fn parse(&self, buf: &[u8]) -> Result<ConnectionRequest, FrameError>;

    /// Produce the canonical header for `request`, without the leftover
    fn encode(&self, request: &ConnectionRequest) -> Result<BytesMut, FrameError>;

    /// Bytes the server sends before any backend data
    fn response_header(&self) -> &'static [u8] {
        &[]
    }
}

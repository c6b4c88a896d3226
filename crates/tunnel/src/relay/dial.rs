//! Outbound connections to the backend

use crate::common::error::DialError;
use crate::protocol::TargetAddr;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Where a session's backend connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPolicy {
    /// Always dial this `host:port`, whatever the request asks for
    Fixed(String),
    /// Dial the target carried in the request header
    Direct,
    /// No backend; sessions are refused before the upgrade
    Unconfigured,
}

impl BackendPolicy {
    pub fn new(backend_address: Option<&str>, allow_direct: bool) -> Self {
        match backend_address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => BackendPolicy::Fixed(address.to_string()),
            None if allow_direct => BackendPolicy::Direct,
            None => BackendPolicy::Unconfigured,
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, BackendPolicy::Unconfigured)
    }

    /// Address to dial for a request targeting `requested`
    pub fn target_for(&self, requested: &TargetAddr) -> Option<String> {
        match self {
            BackendPolicy::Fixed(address) => Some(address.clone()),
            BackendPolicy::Direct => Some(requested.to_string()),
            BackendPolicy::Unconfigured => None,
        }
    }
}

/// Opens byte-stream connections to `host:port` targets
///
/// The relay applies the dial timeout itself.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, target: &str) -> Result<Self::Stream, DialError>;
}

/// Plain TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, target: &str) -> Result<TcpStream, DialError> {
        let addrs: Vec<_> = tokio::net::lookup_host(target)
            .await
            .map_err(|e| DialError::ResolutionFailed {
                target: target.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(DialError::ResolutionFailed {
                target: target.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        trace!("Resolved {} to {:?}", target, addrs);

        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(DialError::Refused {
            target: target.to_string(),
            reason: last_error.map_or_else(|| "unreachable".to_string(), |e| e.to_string()),
        })
    }
}

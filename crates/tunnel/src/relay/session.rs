//! One tunnel session: header, authentication, dial, relay

use super::channel::Channel;
use super::dial::{BackendPolicy, Dialer, TcpDialer};
use super::pump::{PumpOptions, TrafficCounters, pump};
use crate::auth::Authenticator;
use crate::common::error::{DialError, FrameError, RelayError, Result, Side, TunnelError};
use crate::protocol::{Command, ConnectionRequest, Credential, Framer, ProtocolKind};
use bytes::BytesMut;
use edgetunnel_core::tracing::prelude::*;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info_span;
use uuid::Uuid;

/// Relay settings derived from the `tunnel` configuration section
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub backend: BackendPolicy,
    /// Bound on waiting for a complete request header
    pub header_read_timeout: Duration,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    /// Bound on header accumulation; a longer header is malformed
    pub max_header_bytes: usize,
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: BackendPolicy::Unconfigured,
            header_read_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(5),
            max_header_bytes: 4096,
            buffer_size: 16 * 1024,
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingUpgrade,
    HeaderPending,
    Authenticating,
    Dialing,
    Relaying,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingUpgrade => "awaiting_upgrade",
            SessionState::HeaderPending => "header_pending",
            SessionState::Authenticating => "authenticating",
            SessionState::Dialing => "dialing",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the router knows about an upgraded channel
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub protocol: ProtocolKind,
    /// Credential from the query string; replaces the header credential
    /// for authentication only
    pub credential_override: Option<String>,
    pub peer: Option<SocketAddr>,
}

impl SessionRequest {
    pub fn new(protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            credential_override: None,
            peer: None,
        }
    }

    #[must_use]
    pub fn with_credential_override(mut self, credential: Option<String>) -> Self {
        self.credential_override = credential.filter(|c| !c.is_empty());
        self
    }

    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// Result of a session that reached `Closed`
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub protocol: ProtocolKind,
    pub node: String,
    pub target: String,
    pub upstream_bytes: u64,
    pub downstream_bytes: u64,
    pub state: SessionState,
}

struct ActiveSession;

impl ActiveSession {
    fn enter() -> Self {
        counter("tunnel_sessions_total").increment();
        gauge("tunnel_sessions_active").increment();
        Self
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        gauge("tunnel_sessions_active").decrement();
    }
}

/// Runs tunnel sessions over already-upgraded channels
pub struct TunnelRelay<D = TcpDialer> {
    config: Arc<RelayConfig>,
    authenticator: Authenticator,
    dialer: Arc<D>,
    cancel: CancellationToken,
}

impl<D> Clone for TunnelRelay<D> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            authenticator: self.authenticator.clone(),
            dialer: Arc::clone(&self.dialer),
            cancel: self.cancel.clone(),
        }
    }
}

impl<D: Dialer> TunnelRelay<D> {
    pub fn new(config: RelayConfig, authenticator: Authenticator, dialer: D) -> Self {
        Self {
            config: Arc::new(config),
            authenticator,
            dialer: Arc::new(dialer),
            cancel: CancellationToken::new(),
        }
    }

    /// Sessions stop with `Cancelled` once `token` fires
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Checks made before upgrading the inbound request
    ///
    /// Fails with `UpgradeRequired` when no upgrade was requested and with
    /// `NoBackend` when nothing could be dialed.
    pub fn preflight(&self, upgrade_requested: bool) -> Result<()> {
        if !upgrade_requested {
            return Err(TunnelError::UpgradeRequired);
        }
        if !self.config.backend.is_configured() {
            return Err(TunnelError::NoBackend);
        }
        Ok(())
    }

    /// Run one session over `channel` until it closes or fails
    ///
    /// The channel and the backend connection are released on every exit
    /// path.
    pub async fn serve<S>(&self, channel: S, request: SessionRequest) -> Result<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = Uuid::new_v4();
        let span = info_span!(
            "tunnel_session",
            session_id = %id,
            protocol = %request.protocol,
            peer = ?request.peer,
            target = tracing::field::Empty,
            node = tracing::field::Empty,
        );

        async move {
            let _active = ActiveSession::enter();
            let start = tokio::time::Instant::now();
            debug!("Session started");

            let result = self.run(id, channel, &request).await;
            histogram("tunnel_session_duration").observe_duration(start.elapsed());

            match &result {
                Ok(summary) => info!(
                    upstream_bytes = summary.upstream_bytes,
                    downstream_bytes = summary.downstream_bytes,
                    "Session closed"
                ),
                Err(TunnelError::Cancelled) => debug!("Session cancelled"),
                Err(e) if e.is_client_fault() => {
                    debug!(kind = e.kind(), "Session rejected: {}", e);
                }
                Err(e) => warn!(kind = e.kind(), "Session failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run<S>(&self, id: Uuid, channel: S, request: &SessionRequest) -> Result<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Callers hand over the channel once the upgrade completed
        let mut state = SessionState::AwaitingUpgrade;
        transition(&mut state, SessionState::HeaderPending);
        let mut client = Channel::new(channel, Side::Client);

        let counters = TrafficCounters::default();
        let result = self
            .establish(&mut state, &mut client, request, &counters)
            .await;
        let (connection, node, backend) = match result {
            Ok(established) => established,
            Err(e) => {
                transition(&mut state, SessionState::Failed);
                client.close_within(self.config.drain_timeout).await;
                return Err(e);
            }
        };

        transition(&mut state, SessionState::Relaying);
        let options = PumpOptions {
            buffer_size: self.config.buffer_size,
            idle_timeout: self.config.idle_timeout,
            drain_timeout: self.config.drain_timeout,
        };
        let outcome = pump(client.into_inner(), backend, options, &counters, &self.cancel).await;

        if let Err(e) = outcome {
            transition(&mut state, SessionState::Failed);
            debug!(
                upstream_bytes = counters.upstream(),
                downstream_bytes = counters.downstream(),
                "Relay ended with error"
            );
            return Err(e);
        }

        transition(&mut state, SessionState::Closed);
        Ok(SessionSummary {
            id,
            protocol: request.protocol,
            node,
            target: connection,
            upstream_bytes: counters.upstream(),
            downstream_bytes: counters.downstream(),
            state,
        })
    }

    /// Header, authentication and dial; returns the dialed address, the
    /// node name and the backend connection
    async fn establish<S>(
        &self,
        state: &mut SessionState,
        client: &mut Channel<S>,
        request: &SessionRequest,
        counters: &TrafficCounters,
    ) -> Result<(String, String, D::Stream)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let framer = request.protocol.framer();

        let header = self
            .cancellable(self.read_header(client.get_mut(), framer))
            .await
            .inspect_err(|e| {
                if matches!(e, TunnelError::Frame(_) | TunnelError::HeaderTimeout) {
                    counter("tunnel_frame_errors_total").increment();
                }
            })?;
        tracing::Span::current().record("target", tracing::field::display(&header.target));

        transition(state, SessionState::Authenticating);
        let credential = match &request.credential_override {
            Some(token) => Credential::Token(token.clone()),
            None => header.credential.clone(),
        };
        let node = self
            .cancellable(async { Ok(self.authenticator.authenticate(&credential).await?) })
            .await?;
        tracing::Span::current().record("node", node.display_name.as_str());

        if header.command != Command::Connect {
            return Err(TunnelError::UnsupportedCommand(header.command));
        }

        transition(state, SessionState::Dialing);
        let target = self
            .config
            .backend
            .target_for(&header.target)
            .ok_or(TunnelError::NoBackend)?;
        let mut backend = self
            .cancellable(self.dial(&target))
            .await
            .inspect_err(|e| {
                if matches!(e, TunnelError::Dial(_)) {
                    counter("tunnel_dial_errors_total").increment();
                }
            })?;
        debug!("Connected to backend {}", target);

        let handshake = async {
            let response = framer.response_header();
            if !response.is_empty() {
                client.write_all(response).await?;
            }
            if !header.leftover.is_empty() {
                let mut backend_writer = Channel::new(&mut backend, Side::Backend);
                backend_writer.write_all(&header.leftover).await?;
                counters.add_upstream(header.leftover.len() as u64);
            }
            Ok::<_, TunnelError>(())
        };
        self.cancellable(async {
            timeout(self.config.idle_timeout, handshake)
                .await
                .unwrap_or(Err(TunnelError::IdleTimeout))
        })
        .await?;

        Ok((target, node.display_name, backend))
    }

    /// Accumulate client bytes until the framer accepts a header
    async fn read_header<S>(&self, client: &mut S, framer: &dyn Framer) -> Result<ConnectionRequest>
    where
        S: AsyncRead + Unpin,
    {
        let max = self.config.max_header_bytes;
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; self.config.buffer_size.clamp(1, 64 * 1024)];

        let accumulate = async {
            loop {
                let n = client
                    .read(&mut chunk)
                    .await
                    .map_err(|source| RelayError::ReadFailed {
                        side: Side::Client,
                        source,
                    })?;
                buf.extend_from_slice(&chunk[..n]);

                match framer.parse(&buf) {
                    Ok(request) => return Ok(request),
                    Err(FrameError::Truncated) if n == 0 => {
                        return Err(FrameError::Truncated.into());
                    }
                    Err(FrameError::Truncated) if buf.len() >= max => {
                        return Err(FrameError::Malformed(format!(
                            "request header exceeds {max} bytes"
                        ))
                        .into());
                    }
                    Err(FrameError::Truncated) => {
                        trace!(buffered = buf.len(), "Waiting for more header bytes");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        timeout(self.config.header_read_timeout, accumulate)
            .await
            .map_err(|_| TunnelError::HeaderTimeout)?
    }

    async fn dial(&self, target: &str) -> Result<D::Stream> {
        match timeout(self.config.dial_timeout, self.dialer.dial(target)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DialError::Timeout {
                target: target.to_string(),
            }
            .into()),
        }
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            result = fut => result,
        }
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    trace!(from = %state, to = %next, "Session state change");
    *state = next;
}

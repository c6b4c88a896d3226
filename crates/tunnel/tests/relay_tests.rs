//! End-to-end relay sessions over in-memory client channels

use async_trait::async_trait;
use bytes::Bytes;
use edgetunnel::Authenticator;
use edgetunnel::error::{
    AuthError, DialError, FrameError, RegistryError, RelayError, Side, TunnelError,
};
use edgetunnel::protocol::{
    Command, ConnectionRequest, Credential, Framer, Host, ProtocolKind, TargetAddr, Trojan, Vless,
};
use edgetunnel::registry::{self, MemoryNodeStore, NodeRecord, NodeStore};
use edgetunnel::relay::{
    BackendPolicy, Dialer, RelayConfig, SessionRequest, SessionState, TcpDialer, TunnelRelay,
};
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, duplex,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NODE_ID: &str = "5b1e3c8a-8a53-4f4e-9f52-0c6b7f1d2e3a";

fn node_id() -> Uuid {
    Uuid::parse_str(NODE_ID).unwrap()
}

fn store() -> Arc<dyn NodeStore> {
    Arc::new(MemoryNodeStore::with_records([NodeRecord::new(
        NODE_ID, "tokyo",
    )]))
}

fn new_relay<D: Dialer>(
    store: Arc<dyn NodeStore>,
    backend: BackendPolicy,
    dialer: D,
) -> TunnelRelay<D> {
    let config = RelayConfig {
        backend,
        ..RelayConfig::default()
    };
    TunnelRelay::new(config, Authenticator::new(store), dialer)
}

fn fixed() -> BackendPolicy {
    BackendPolicy::Fixed("backend.test:80".into())
}

fn header(framer: &dyn Framer, credential: Credential, command: Command) -> Vec<u8> {
    let request = ConnectionRequest {
        protocol: framer.kind(),
        credential,
        target: TargetAddr::domain("example.test", 443),
        command,
        leftover: Bytes::new(),
    };
    framer.encode(&request).unwrap().to_vec()
}

fn vless_header(id: Uuid) -> Vec<u8> {
    header(&Vless, Credential::Uuid(id), Command::Connect)
}

/// Hands out one prepared in-memory backend connection
struct DuplexDialer {
    backend: Mutex<Option<DuplexStream>>,
}

impl DuplexDialer {
    fn new() -> (Self, DuplexStream) {
        let (backend, backend_peer) = duplex(64 * 1024);
        let dialer = Self {
            backend: Mutex::new(Some(backend)),
        };
        (dialer, backend_peer)
    }
}

#[async_trait]
impl Dialer for DuplexDialer {
    type Stream = DuplexStream;

    async fn dial(&self, target: &str) -> Result<DuplexStream, DialError> {
        let backend = self.backend.lock().unwrap().take();
        backend.ok_or_else(|| DialError::Refused {
            target: target.to_string(),
            reason: "already dialed".to_string(),
        })
    }
}

/// Records every dial attempt and refuses it
#[derive(Clone, Default)]
struct RecordingDialer {
    targets: Arc<Mutex<Vec<String>>>,
}

impl RecordingDialer {
    fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for RecordingDialer {
    type Stream = DuplexStream;

    async fn dial(&self, target: &str) -> Result<DuplexStream, DialError> {
        self.targets.lock().unwrap().push(target.to_string());
        Err(DialError::Refused {
            target: target.to_string(),
            reason: "recording only".to_string(),
        })
    }
}

/// Backend connection that accepts writes and resets on read
struct ResettingStream;

impl AsyncRead for ResettingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
    }
}

impl AsyncWrite for ResettingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct ResettingDialer;

#[async_trait]
impl Dialer for ResettingDialer {
    type Stream = ResettingStream;

    async fn dial(&self, _target: &str) -> Result<ResettingStream, DialError> {
        Ok(ResettingStream)
    }
}

struct OfflineStore;

#[async_trait]
impl NodeStore for OfflineStore {
    async fn list(&self) -> registry::Result<Vec<NodeRecord>> {
        Err(RegistryError::Unavailable("storage offline".into()))
    }

    async fn add(&self, _record: NodeRecord) -> registry::Result<()> {
        Err(RegistryError::Unavailable("storage offline".into()))
    }

    async fn remove(&self, _identifier: &str) -> registry::Result<NodeRecord> {
        Err(RegistryError::Unavailable("storage offline".into()))
    }
}

#[tokio::test]
async fn test_vless_request_reaches_tcp_backend_and_reply_returns() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let backend_addr = listener.local_addr().unwrap();
    let backend = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 5];
        socket.read_exact(&mut request).await.unwrap();
        socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        socket.shutdown().await.unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        (request, rest)
    });

    let relay = new_relay(
        store(),
        BackendPolicy::Fixed(backend_addr.to_string()),
        TcpDialer,
    );
    let (client, mut peer) = duplex(64 * 1024);

    let serving = relay.serve(client, SessionRequest::new(ProtocolKind::Vless));
    let driving = async {
        let mut first = vless_header(node_id());
        first.extend_from_slice(b"GET /");
        peer.write_all(&first).await.unwrap();

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).await.unwrap();
        peer.shutdown().await.unwrap();
        reply
    };
    let (result, reply) = tokio::join!(serving, driving);

    let summary = result.unwrap();
    assert_eq!(summary.state, SessionState::Closed);
    assert_eq!(summary.node, "tokyo");
    assert_eq!(summary.target, backend_addr.to_string());
    assert_eq!(summary.upstream_bytes, 5);
    assert_eq!(summary.downstream_bytes, 19);

    assert_eq!(&reply[..2], &[0, 0]);
    assert_eq!(&reply[2..], b"HTTP/1.1 200 OK\r\n\r\n");

    let (request, rest) = backend.await.unwrap();
    assert_eq!(&request, b"GET /");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_trojan_bad_credential_never_dials() {
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);

    let mut first = header(
        &Trojan,
        Credential::Token("not-a-registered-password".into()),
        Command::Connect,
    );
    first.extend_from_slice(b"payload");
    peer.write_all(&first).await.unwrap();

    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Trojan))
        .await;
    assert!(matches!(result, Err(TunnelError::Auth(AuthError::Invalid))));
    assert!(dialer.targets().is_empty());

    // Client channel was closed without any reply
    let mut reply = Vec::new();
    peer.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_header_times_out() {
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&[0, 1, 2]).await.unwrap();

    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    assert!(matches!(result, Err(TunnelError::HeaderTimeout)));
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn test_client_eof_inside_header_is_truncated() {
    let relay = new_relay(store(), fixed(), RecordingDialer::default());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&vless_header(node_id())[..10]).await.unwrap();
    peer.shutdown().await.unwrap();

    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    assert!(matches!(
        result,
        Err(TunnelError::Frame(FrameError::Truncated))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_backend_closing_first_ends_session_cleanly() {
    let (dialer, mut backend_peer) = DuplexDialer::new();
    backend_peer.write_all(b"bye").await.unwrap();
    backend_peer.shutdown().await.unwrap();

    let relay = new_relay(store(), fixed(), dialer);
    let (client, mut peer) = duplex(4096);

    let serving = relay.serve(client, SessionRequest::new(ProtocolKind::Vless));
    let driving = async {
        peer.write_all(&vless_header(node_id())).await.unwrap();
        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).await.unwrap();
        reply
    };
    // The client never closes; the drain window ends the session
    let (result, reply) = tokio::join!(serving, driving);

    let summary = result.unwrap();
    assert_eq!(summary.state, SessionState::Closed);
    assert_eq!(summary.downstream_bytes, 3);
    assert_eq!(reply, b"\0\0bye");
}

#[tokio::test]
async fn test_leftover_precedes_later_client_bytes() {
    let (dialer, mut backend_peer) = DuplexDialer::new();
    let relay = new_relay(store(), fixed(), dialer);
    let (client, mut peer) = duplex(4096);

    let serving = relay.serve(client, SessionRequest::new(ProtocolKind::Vless));
    let client_side = async {
        let mut first = vless_header(node_id());
        first.extend_from_slice(b"one");
        peer.write_all(&first).await.unwrap();
        peer.write_all(b"two").await.unwrap();
        peer.write_all(b"three").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).await.unwrap();
        reply
    };
    let backend_side = async {
        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        backend_peer.shutdown().await.unwrap();
        received
    };
    let (result, reply, received) = tokio::join!(serving, client_side, backend_side);

    let summary = result.unwrap();
    assert_eq!(received, b"onetwothree");
    assert_eq!(reply, [0, 0]);
    assert_eq!(summary.upstream_bytes, 11);
}

#[tokio::test]
async fn test_trojan_session_has_no_response_header() {
    let (dialer, mut backend_peer) = DuplexDialer::new();
    let relay = new_relay(store(), fixed(), dialer);
    let (client, mut peer) = duplex(4096);

    let serving = relay.serve(client, SessionRequest::new(ProtocolKind::Trojan));
    let client_side = async {
        let mut first = header(&Trojan, Credential::Token(NODE_ID.into()), Command::Connect);
        first.extend_from_slice(b"hi");
        peer.write_all(&first).await.unwrap();
        peer.shutdown().await.unwrap();

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).await.unwrap();
        reply
    };
    let backend_side = async {
        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        backend_peer.write_all(b"ok").await.unwrap();
        backend_peer.shutdown().await.unwrap();
        received
    };
    let (result, reply, received) = tokio::join!(serving, client_side, backend_side);

    assert_eq!(result.unwrap().node, "tokyo");
    assert_eq!(received, b"hi");
    assert_eq!(reply, b"ok");
}

#[tokio::test]
async fn test_store_failure_is_not_reported_as_bad_credential() {
    let dialer = RecordingDialer::default();
    let relay = new_relay(Arc::new(OfflineStore), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&vless_header(node_id())).await.unwrap();

    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        TunnelError::Auth(AuthError::StoreUnavailable(_))
    ));
    assert!(!error.is_client_fault());
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn test_associate_is_refused_after_authentication() {
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&header(
        &Vless,
        Credential::Uuid(node_id()),
        Command::Associate,
    ))
    .await
    .unwrap();

    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    assert!(matches!(
        result,
        Err(TunnelError::UnsupportedCommand(Command::Associate))
    ));
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn test_direct_policy_dials_requested_target() {
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), BackendPolicy::Direct, dialer.clone());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&vless_header(node_id())).await.unwrap();

    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    assert!(matches!(
        result,
        Err(TunnelError::Dial(DialError::Refused { .. }))
    ));
    assert_eq!(dialer.targets(), ["example.test:443"]);
}

#[tokio::test]
async fn test_fixed_backend_overrides_requested_target() {
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);
    let request = ConnectionRequest {
        protocol: ProtocolKind::Vless,
        credential: Credential::Uuid(node_id()),
        target: TargetAddr::new(Host::Ipv4(Ipv4Addr::new(192, 0, 2, 7)), 8443),
        command: Command::Connect,
        leftover: Bytes::new(),
    };
    peer.write_all(&Vless.encode(&request).unwrap()).await.unwrap();

    let _ = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    assert_eq!(dialer.targets(), ["backend.test:80"]);
}

#[tokio::test]
async fn test_query_override_replaces_header_credential() {
    // Unregistered header id, registered override: authentication passes
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&vless_header(Uuid::new_v4())).await.unwrap();

    let request =
        SessionRequest::new(ProtocolKind::Vless).with_credential_override(Some(NODE_ID.into()));
    let result = relay.serve(client, request).await;
    assert!(matches!(result, Err(TunnelError::Dial(_))));
    assert_eq!(dialer.targets().len(), 1);

    // Registered header id, unregistered override: rejected
    let dialer = RecordingDialer::default();
    let relay = new_relay(store(), fixed(), dialer.clone());
    let (client, mut peer) = duplex(4096);
    peer.write_all(&vless_header(node_id())).await.unwrap();

    let request = SessionRequest::new(ProtocolKind::Vless)
        .with_credential_override(Some("someone-else".into()));
    let result = relay.serve(client, request).await;
    assert!(matches!(result, Err(TunnelError::Auth(AuthError::Invalid))));
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn test_cancelled_relay_ends_sessions() {
    let token = CancellationToken::new();
    let relay =
        new_relay(store(), fixed(), RecordingDialer::default()).with_cancellation(token.clone());
    token.cancel();

    let (client, _peer) = duplex(4096);
    let result = relay
        .serve(client, SessionRequest::new(ProtocolKind::Vless))
        .await;
    assert!(matches!(result, Err(TunnelError::Cancelled)));
}

#[tokio::test]
async fn test_oversized_header_is_malformed_without_dialing() {
    let dialer = RecordingDialer::default();
    let config = RelayConfig {
        backend: fixed(),
        max_header_bytes: 68,
        ..RelayConfig::default()
    };
    let relay = TunnelRelay::new(config, Authenticator::new(store()), dialer.clone());
    let (client, mut peer) = duplex(4096);

    let serving = relay.serve(client, SessionRequest::new(ProtocolKind::Vless));
    let trickling = async {
        // Valid version and id, then an addon that never fits under the bound
        let mut prefix = vec![0u8];
        prefix.extend_from_slice(node_id().as_bytes());
        prefix.push(255);
        peer.write_all(&prefix).await.unwrap();
        for _ in 0..16 {
            if peer.write_all(&[0u8; 8]).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
    };
    let (result, ()) = tokio::join!(serving, trickling);

    assert!(matches!(
        result,
        Err(TunnelError::Frame(FrameError::Malformed(_)))
    ));
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn test_backend_read_error_fails_session_and_closes_client() {
    let relay = new_relay(store(), fixed(), ResettingDialer);
    let (client, mut peer) = duplex(4096);

    let serving = relay.serve(client, SessionRequest::new(ProtocolKind::Vless));
    let client_side = async {
        peer.write_all(&vless_header(node_id())).await.unwrap();
        // Client keeps its side open; the relay must still close it
        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).await.unwrap();
        reply
    };
    let (result, reply) = tokio::join!(serving, client_side);

    assert!(matches!(
        result,
        Err(TunnelError::Relay(RelayError::ReadFailed {
            side: Side::Backend,
            ..
        }))
    ));
    assert_eq!(reply, [0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_reaches_blocked_response_write() {
    let token = CancellationToken::new();
    let (dialer, _backend_peer) = DuplexDialer::new();
    let relay = new_relay(store(), fixed(), dialer).with_cancellation(token.clone());
    // One byte of buffering: the two-byte response stalls while unread
    let (client, mut peer) = duplex(1);

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let serving = tokio::time::timeout(
        Duration::from_secs(3600),
        relay.serve(client, SessionRequest::new(ProtocolKind::Vless)),
    );
    let sending = async {
        peer.write_all(&vless_header(node_id())).await.unwrap();
        std::future::pending::<()>().await;
    };
    let result = tokio::select! {
        result = serving => result,
        () = sending => unreachable!(),
    };

    assert!(matches!(result, Ok(Err(TunnelError::Cancelled))));
}

//! WebSocket to byte-stream adapter
//!
//! Wraps an upgraded socket so the relay can treat it like any other
//! `AsyncRead + AsyncWrite` channel.

use axum::extract::ws::Message;
use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Open,
    /// Close frame queued, not yet flushed
    Closing,
    Closed,
}

/// Byte stream over a message socket
///
/// Binary and text messages are read as bytes, ping and pong are skipped,
/// and a close message (or the end of the socket) is end-of-stream. Writes
/// become binary messages; shutdown sends a single close message.
pub struct WsStream<S> {
    socket: S,
    pending: Bytes,
    read_closed: bool,
    write_state: WriteState,
}

impl<S> WsStream<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            pending: Bytes::new(),
            read_closed: false,
            write_state: WriteState::Open,
        }
    }

    pub fn into_inner(self) -> S {
        self.socket
    }
}

fn socket_error(action: &str, e: impl Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        format!("websocket {action} failed: {e}"),
    )
}

impl<S, E> AsyncRead for WsStream<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.socket).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = data,
                Some(Ok(Message::Text(text))) => {
                    this.pending = Bytes::copy_from_slice(text.as_str().as_bytes());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => this.read_closed = true,
                Some(Err(e)) => return Poll::Ready(Err(socket_error("read", e))),
            }
        }
    }
}

impl<S, E> AsyncWrite for WsStream<S>
where
    S: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_state != WriteState::Open {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        ready!(Pin::new(&mut this.socket).poll_ready(cx)).map_err(|e| socket_error("write", e))?;
        Pin::new(&mut this.socket)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(|e| socket_error("write", e))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_state == WriteState::Closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.socket)
            .poll_flush(cx)
            .map_err(|e| socket_error("flush", e))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.write_state {
                WriteState::Closed => return Poll::Ready(Ok(())),
                WriteState::Open => {
                    let queued = ready!(Pin::new(&mut this.socket).poll_ready(cx)).and_then(|()| {
                        Pin::new(&mut this.socket).start_send(Message::Close(None))
                    });
                    if let Err(e) = queued {
                        this.write_state = WriteState::Closed;
                        return Poll::Ready(Err(socket_error("close", e)));
                    }
                    this.write_state = WriteState::Closing;
                }
                WriteState::Closing => {
                    let flushed = ready!(Pin::new(&mut this.socket).poll_flush(cx));
                    this.write_state = WriteState::Closed;
                    return Poll::Ready(flushed.map_err(|e| socket_error("close", e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::TunnelError;
    use crate::relay::pump::{PumpOptions, TrafficCounters, pump};
    use axum::extract::ws::Utf8Bytes;
    use futures::StreamExt;
    use futures::channel::mpsc::{
        self, Receiver, SendError, Sender, UnboundedReceiver, UnboundedSender,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    /// Socket half-duplex pair backed by channels
    struct FakeSocket {
        incoming: UnboundedReceiver<Result<Message, io::Error>>,
        outgoing: UnboundedSender<Message>,
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx)
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = SendError;

        fn poll_ready(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), SendError> {
            Pin::new(&mut self.outgoing).start_send(item)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_flush(cx)
        }

        fn poll_close(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_close(cx)
        }
    }

    /// Client that sends nothing and has stopped reading
    ///
    /// The outgoing channel has room for one message, nobody drains it.
    struct StalledSocket {
        incoming: Receiver<Result<Message, io::Error>>,
        outgoing: Sender<Message>,
    }

    impl Stream for StalledSocket {
        type Item = Result<Message, io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx)
        }
    }

    impl Sink<Message> for StalledSocket {
        type Error = SendError;

        fn poll_ready(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), SendError> {
            Pin::new(&mut self.outgoing).start_send(item)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_flush(cx)
        }

        fn poll_close(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_close(cx)
        }
    }

    fn socket() -> (
        WsStream<FakeSocket>,
        UnboundedSender<Result<Message, io::Error>>,
        UnboundedReceiver<Message>,
    ) {
        let (to_stream, incoming) = mpsc::unbounded();
        let (outgoing, from_stream) = mpsc::unbounded();
        (
            WsStream::new(FakeSocket { incoming, outgoing }),
            to_stream,
            from_stream,
        )
    }

    #[tokio::test]
    async fn test_reads_binary_and_text_skipping_control_frames() {
        let (mut stream, tx, _rx) = socket();
        tx.unbounded_send(Ok(Message::Binary(Bytes::from_static(b"abc"))))
            .unwrap();
        tx.unbounded_send(Ok(Message::Ping(Bytes::from_static(b"p"))))
            .unwrap();
        tx.unbounded_send(Ok(Message::Text(Utf8Bytes::from_static("def"))))
            .unwrap();
        tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        tx.unbounded_send(Ok(Message::Binary(Bytes::from_static(b"late"))))
            .unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abcdef");
    }

    #[tokio::test]
    async fn test_small_reads_drain_one_message() {
        let (mut stream, tx, _rx) = socket();
        tx.unbounded_send(Ok(Message::Binary(Bytes::from_static(b"hello"))))
            .unwrap();

        let mut two = [0u8; 2];
        stream.read_exact(&mut two).await.unwrap();
        assert_eq!(&two, b"he");
        let mut three = [0u8; 3];
        stream.read_exact(&mut three).await.unwrap();
        assert_eq!(&three, b"llo");
    }

    #[tokio::test]
    async fn test_end_of_socket_is_eof() {
        let (mut stream, tx, _rx) = socket();
        drop(tx);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_error_is_io_error() {
        let (mut stream, tx, _rx) = socket();
        tx.unbounded_send(Err(io::Error::other("boom"))).unwrap();
        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_writes_are_binary_and_shutdown_closes_once() {
        let (mut stream, _tx, rx) = socket();
        stream.write_all(b"payload").await.unwrap();
        stream.shutdown().await.unwrap();
        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"more").await.is_err());
        drop(stream);

        let sent: Vec<Message> = rx.collect().await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Message::Binary(data) if data.as_ref() == b"payload"));
        assert!(matches!(sent[1], Message::Close(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_does_not_hold_cancelled_relay() {
        let (_to_stream, incoming) = mpsc::channel(0);
        let (outgoing, _unread) = mpsc::channel(0);
        let client = WsStream::new(StalledSocket { incoming, outgoing });
        let (backend, mut backend_peer) = tokio::io::duplex(64 * 1024);
        backend_peer.write_all(&[1u8; 64 * 1024]).await.unwrap();

        let counters = TrafficCounters::default();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let options = PumpOptions {
            buffer_size: 1024,
            idle_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            pump(client, backend, options, &counters, &cancel),
        )
        .await;

        assert!(matches!(result, Ok(Err(TunnelError::Cancelled))));
    }
}

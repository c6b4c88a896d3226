//! Write side of a relayed channel with idempotent close

use crate::common::error::{RelayError, Side};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Owns the writable end of one side of a session
///
/// `close` shuts the writer down at most once; later calls are no-ops.
#[derive(Debug)]
pub struct Channel<W> {
    inner: W,
    side: Side,
    closed: bool,
}

impl<W> Channel<W> {
    pub fn new(inner: W, side: Side) -> Self {
        Self {
            inner,
            side,
            closed: false,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> Channel<W> {
    /// Write and flush `buf`
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::WriteFailed {
                side: self.side,
                source: io::ErrorKind::BrokenPipe.into(),
            });
        }
        let side = self.side;
        self.inner
            .write_all(buf)
            .await
            .map_err(|source| RelayError::WriteFailed { side, source })?;
        self.inner
            .flush()
            .await
            .map_err(|source| RelayError::WriteFailed { side, source })
    }

    /// Shut the writer down
    ///
    /// Peers that already went away are not an error here.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            trace!(side = %self.side, "Shutdown after peer went away: {}", e);
        }
    }

    /// Like [`close`](Self::close) but gives up after `limit`
    ///
    /// Returns false when the peer stalled the shutdown. The writer counts as
    /// closed either way and should be dropped.
    pub async fn close_within(&mut self, limit: Duration) -> bool {
        if timeout(limit, self.close()).await.is_ok() {
            return true;
        }
        debug!(side = %self.side, "Shutdown stalled, dropping channel");
        false
    }
}

/// Whether `e` only means the peer closed the connection
pub fn is_connection_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

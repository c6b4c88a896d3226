//! Bidirectional byte pump between client and backend

use super::channel::{Channel, is_connection_closed_error};
use crate::common::error::{RelayError, Side, TunnelError};
use edgetunnel_core::tracing::metrics::{Counter, counter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes moved in each direction of one session
#[derive(Debug, Clone, Default)]
pub struct TrafficCounters {
    upstream: Arc<AtomicU64>,
    downstream: Arc<AtomicU64>,
}

impl TrafficCounters {
    /// Client to backend
    pub fn upstream(&self) -> u64 {
        self.upstream.load(Ordering::Relaxed)
    }

    /// Backend to client
    pub fn downstream(&self) -> u64 {
        self.downstream.load(Ordering::Relaxed)
    }

    /// Count bytes written to the backend before the pump starts
    pub(crate) fn add_upstream(&self, n: u64) {
        self.upstream.fetch_add(n, Ordering::Relaxed);
        counter("tunnel_bytes_upstream_total").add(n);
    }
}

/// Last time a byte moved in either direction
#[derive(Debug)]
struct Activity {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Timing knobs for [`pump`]
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    pub buffer_size: usize,
    /// Session fails when no byte moves for this long
    pub idle_timeout: Duration,
    /// How long the remaining direction may sit idle after the first EOF
    ///
    /// Also bounds the shutdown of each writer at teardown.
    pub drain_timeout: Duration,
}

struct Direction<'a> {
    from: Side,
    bytes: &'a AtomicU64,
    metric: Counter,
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut Channel<W>,
    direction: Direction<'_>,
    activity: &Activity,
    buffer_size: usize,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|source| RelayError::ReadFailed {
                side: direction.from,
                source,
            })?;
        if n == 0 {
            trace!(side = %direction.from, total, "End of stream, half-closing peer");
            writer.close().await;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        let n = n as u64;
        total += n;
        direction.bytes.fetch_add(n, Ordering::Relaxed);
        direction.metric.add(n);
        activity.touch();
    }
}

/// Copy bytes both ways until both directions finish
///
/// The first end-of-stream half-closes the opposite writer and starts the
/// drain window, which moves forward each time bytes flow. An I/O error on
/// either side, the idle timeout or cancellation ends the session at once.
/// Both writers are closed on every exit path, each within `drain_timeout`.
pub async fn pump<C, B>(
    client: C,
    backend: B,
    options: PumpOptions,
    counters: &TrafficCounters,
    cancel: &CancellationToken,
) -> Result<(), TunnelError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, client_writer) = tokio::io::split(client);
    let (mut backend_reader, backend_writer) = tokio::io::split(backend);
    let mut client_writer = Channel::new(client_writer, Side::Client);
    let mut backend_writer = Channel::new(backend_writer, Side::Backend);
    let activity = Activity::new();

    let result = {
        let upstream = copy_half(
            &mut client_reader,
            &mut backend_writer,
            Direction {
                from: Side::Client,
                bytes: &counters.upstream,
                metric: counter("tunnel_bytes_upstream_total"),
            },
            &activity,
            options.buffer_size,
        );
        let downstream = copy_half(
            &mut backend_reader,
            &mut client_writer,
            Direction {
                from: Side::Backend,
                bytes: &counters.downstream,
                metric: counter("tunnel_bytes_downstream_total"),
            },
            &activity,
            options.buffer_size,
        );
        tokio::pin!(upstream, downstream);

        let mut upstream_done = false;
        let mut downstream_done = false;
        let mut drain_started: Option<Instant> = None;
        let drain_end = |started: Instant| started.max(activity.last()) + options.drain_timeout;

        loop {
            let idle_deadline = activity.last() + options.idle_timeout;
            let drain_deadline = drain_started.map(drain_end);
            let drain = async move {
                match drain_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => break Err(TunnelError::Cancelled),

                result = &mut upstream, if !upstream_done => match result {
                    Ok(bytes) => {
                        debug!(bytes, "Client finished sending");
                        upstream_done = true;
                        if downstream_done {
                            break Ok(());
                        }
                        drain_started = Some(Instant::now());
                    }
                    Err(e) => break Err(e.into()),
                },

                result = &mut downstream, if !downstream_done => match result {
                    Ok(bytes) => {
                        debug!(bytes, "Backend finished sending");
                        downstream_done = true;
                        if upstream_done {
                            break Ok(());
                        }
                        drain_started = Some(Instant::now());
                    }
                    Err(e) => break Err(e.into()),
                },

                () = sleep_until(idle_deadline) => {
                    // Bytes may have moved while we slept
                    if activity.last() + options.idle_timeout <= Instant::now() {
                        break Err(TunnelError::IdleTimeout);
                    }
                }

                () = drain => {
                    let quiet = drain_started
                        .map(drain_end)
                        .is_some_and(|deadline| deadline <= Instant::now());
                    if quiet {
                        debug!("Drain window elapsed, closing remaining direction");
                        break Ok(());
                    }
                }
            }
        }
    };

    tokio::join!(
        client_writer.close_within(options.drain_timeout),
        backend_writer.close_within(options.drain_timeout),
    );

    if let Err(TunnelError::Relay(
        RelayError::ReadFailed { side, source } | RelayError::WriteFailed { side, source },
    )) = &result
        && is_connection_closed_error(source)
    {
        debug!(side = %side, "Peer reset the connection");
    }

    result
}

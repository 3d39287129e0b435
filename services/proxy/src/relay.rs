//! Relay Engine.
//!
//! Bidirectional copy between two byte streams that never splits a TLS
//! record across writes. When a read ends partway through a record, a
//! bounded number of short extra reads complete it before anything is
//! written. Bytes that do not look like TLS pass through as read.
//!
//! Either side closing (or the owner's shutdown signal) ends the relay and
//! closes both streams. The idle deadline covers the relay as a whole: a
//! silent direction is fine as long as the other one is moving.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};
use veil_tls::{classify, scan_records, RecordScan};

use crate::session::Activity;

/// Initial read buffer; grows when a record straddles its end.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Longest the relay may go without forwarding a byte in either direction.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait per extra read while completing a record.
pub const DEFAULT_FILL_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra reads allowed to complete one record.
pub const DEFAULT_FILL_RETRIES: usize = 8;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub fill_timeout: Duration,
    pub fill_retries: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            fill_timeout: DEFAULT_FILL_TIMEOUT,
            fill_retries: DEFAULT_FILL_RETRIES,
        }
    }
}

/// Bytes copied in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Reads the next chunk into `buf`, completing a trailing partial record.
///
/// Returns the number of bytes at the front of `buf` to forward; 0 means
/// end of stream. The chunk is cut short only when the peer closes or the
/// retry budget runs out mid-record.
pub async fn read_records<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    config: &RelayConfig,
) -> io::Result<usize> {
    if buf.len() < config.buffer_size {
        buf.resize(config.buffer_size, 0);
    }

    let filled = reader.read(&mut buf[..]).await?;
    if filled == 0 {
        return Ok(0);
    }
    complete_record(reader, buf, filled, config).await
}

/// Extends the `filled` bytes at the front of `buf` until the last record
/// in them is whole, within the fill budget. Returns the new length.
pub async fn complete_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    mut filled: usize,
    config: &RelayConfig,
) -> io::Result<usize> {
    let mut retries = 0;
    while let RecordScan::Partial { needed, .. } = scan_records(&buf[..filled]) {
        if retries == config.fill_retries {
            debug!(filled, needed, "Record incomplete after retries, forwarding as is");
            break;
        }
        retries += 1;

        if buf.len() < filled + needed {
            buf.resize(filled + needed, 0);
        }
        match timeout(config.fill_timeout, reader.read(&mut buf[filled..filled + needed])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
            Err(_) => trace!(retries, needed, "Record fill read timed out"),
        }
    }

    Ok(filled)
}

async fn copy_records<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: &'static str,
    config: &RelayConfig,
    clock: &Activity,
    activity: Option<&Activity>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let n = read_records(reader, &mut buf, config).await?;
        if n == 0 {
            break;
        }
        trace!(direction, kind = %classify(&buf[..n]), bytes = n, "Relaying");

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        match timeout(config.write_timeout, write).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
        }

        *total += n as u64;
        clock.touch();
        if let Some(activity) = activity {
            activity.touch();
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Resolves once `clock` has not been touched for `limit`.
async fn idle_expired(clock: &Activity, limit: Duration) {
    loop {
        let idle = clock.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// One relay between two streams.
///
/// ```ignore
/// let stats = Relay::new(config)
///     .label("client<->target")
///     .activity(session.activity().clone())
///     .run(client, target)
///     .await?;
/// ```
pub struct Relay {
    config: RelayConfig,
    label: &'static str,
    activity: Option<Activity>,
    shutdown: Option<oneshot::Receiver<()>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            label: "relay",
            activity: None,
            shutdown: None,
        }
    }

    pub fn label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// Touched after every forwarded chunk.
    pub fn activity(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Ends the relay when fired or dropped.
    pub fn shutdown(mut self, shutdown: oneshot::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn run<A, B>(self, a: A, b: B) -> io::Result<RelayStats>
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let Relay {
            config,
            label,
            activity,
            shutdown,
        } = self;
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);
        let mut stats = RelayStats::default();
        let config = &config;
        let activity = activity.as_ref();
        let clock = Activity::new();

        let stopped = async move {
            match shutdown {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let result = {
            let a_to_b = copy_records(
                &mut a_read,
                &mut b_write,
                "a->b",
                config,
                &clock,
                activity,
                &mut stats.a_to_b,
            );
            let b_to_a = copy_records(
                &mut b_read,
                &mut a_write,
                "b->a",
                config,
                &clock,
                activity,
                &mut stats.b_to_a,
            );

            tokio::select! {
                result = a_to_b => result,
                result = b_to_a => result,
                _ = idle_expired(&clock, config.idle_timeout) => {
                    debug!(relay = label, idle_timeout = ?config.idle_timeout, "Relay idle in both directions");
                    Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))
                }
                _ = stopped => {
                    debug!(relay = label, "Relay stopped by owner");
                    Ok(())
                }
            }
        };

        let _ = a_write.shutdown().await;
        let _ = b_write.shutdown().await;

        debug!(
            relay = label,
            a_to_b = stats.a_to_b,
            b_to_a = stats.b_to_a,
            "Relay finished"
        );
        result.map(|_| stats)
    }
}

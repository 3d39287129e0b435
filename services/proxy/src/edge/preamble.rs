//! Client preamble detection.
//!
//! The first bytes of an edge connection decide how it is handled:
//! - `CONNECT host:port` is answered with `200 Connection Established` and
//!   the first tunnelled TLS record is read next
//! - a TLS Handshake record is the ClientHello itself
//! - any other HTTP request is plain HTTP, passed through to its `Host`

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;
use veil_tls::{parse_record_header, ContentType, RECORD_HEADER_LEN};

/// Default time allowed for the preamble to arrive.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on an HTTP request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

pub(crate) const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone)]
pub struct PreambleConfig {
    pub timeout: Duration,
    pub max_head_bytes: usize,
}

impl Default for PreambleConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
        }
    }
}

/// What the client opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// An HTTP CONNECT, already answered. `first` holds the bytes the client
    /// sent through the tunnel: normally one ClientHello record, empty when
    /// the client waits for the server to speak first.
    Connect {
        host: String,
        port: u16,
        first: Vec<u8>,
    },
    /// A bare ClientHello record.
    Tls { hello: Vec<u8> },
    /// A plain HTTP request. `head` is every byte read so far.
    Http {
        host: String,
        port: Option<u16>,
        head: Vec<u8>,
    },
}

#[derive(Debug, Error)]
pub enum PreambleError {
    #[error("client closed before sending a preamble")]
    Closed,

    #[error("no preamble within {0:?}")]
    Timeout(Duration),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request names no target host")]
    MissingHost,

    #[error(transparent)]
    Io(#[from] io::Error),
}

struct HttpHead {
    len: usize,
    method: String,
    target: String,
    host: Option<String>,
}

enum Sniffed {
    Tls,
    Http(HttpHead),
}

/// Reads and classifies the preamble, answering a CONNECT on the way.
pub async fn read_preamble<S>(
    stream: &mut S,
    config: &PreambleConfig,
) -> Result<Preamble, PreambleError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let sniffed = timeout(config.timeout, sniff(stream, &mut buf, config.max_head_bytes))
        .await
        .map_err(|_| PreambleError::Timeout(config.timeout))??;

    let head = match sniffed {
        Sniffed::Tls => return Ok(Preamble::Tls { hello: buf }),
        Sniffed::Http(head) => head,
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(&head.target)
            .ok_or_else(|| PreambleError::Malformed(format!("bad CONNECT target '{}'", head.target)))?;
        stream.write_all(CONNECT_ESTABLISHED).await?;
        stream.flush().await?;

        let mut first = buf.split_off(head.len);
        match timeout(config.timeout, read_first_record(stream, &mut first)).await {
            Ok(result) => result?,
            Err(_) => debug!(host = %host, "No client bytes after CONNECT"),
        }
        return Ok(Preamble::Connect {
            host,
            port: port.unwrap_or(443),
            first,
        });
    }

    let authority = head
        .host
        .or_else(|| absolute_authority(&head.target))
        .ok_or(PreambleError::MissingHost)?;
    let (host, port) = split_authority(&authority).ok_or(PreambleError::MissingHost)?;
    Ok(Preamble::Http {
        host,
        port,
        head: buf,
    })
}

async fn sniff<R>(stream: &mut R, buf: &mut Vec<u8>, max: usize) -> Result<Sniffed, PreambleError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(&first) = buf.first() {
            if first == ContentType::Handshake as u8 {
                fill_record(stream, buf).await?;
                return Ok(Sniffed::Tls);
            }
            if let Some(head) = parse_head(buf)? {
                return Ok(Sniffed::Http(head));
            }
            if buf.len() >= max {
                return Err(PreambleError::HeadTooLarge(max));
            }
        }
        read_more(stream, buf).await?;
    }
}

/// `None` while the head is still partial.
fn parse_head(buf: &[u8]) -> Result<Option<HttpHead>, PreambleError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            Ok(Some(HttpHead {
                len,
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                host,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(PreambleError::Malformed(e.to_string())),
    }
}

/// Completes the TLS record at the start of `buf`. Bytes that do not look
/// like a record are left as they are.
async fn fill_record<R>(stream: &mut R, buf: &mut Vec<u8>) -> Result<(), PreambleError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < RECORD_HEADER_LEN {
        read_more(stream, buf).await?;
    }
    let header = parse_record_header(buf).map_err(|e| PreambleError::Malformed(e.to_string()))?;
    if !header.looks_like_tls() {
        return Ok(());
    }
    while buf.len() < header.record_len() {
        read_more(stream, buf).await?;
    }
    Ok(())
}

async fn read_first_record<R>(stream: &mut R, buf: &mut Vec<u8>) -> Result<(), PreambleError>
where
    R: AsyncRead + Unpin,
{
    if buf.is_empty() {
        read_more(stream, buf).await?;
    }
    if buf[0] == ContentType::Handshake as u8 {
        fill_record(stream, buf).await?;
    }
    Ok(())
}

async fn read_more<R>(stream: &mut R, buf: &mut Vec<u8>) -> Result<(), PreambleError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(PreambleError::Closed);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Authority of an absolute-form request target (`http://host:port/path`).
fn absolute_authority(target: &str) -> Option<String> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    (!authority.is_empty()).then(|| authority.to_string())
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn split_authority(authority: &str) -> Option<(String, Option<u16>)> {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_string(), port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port.parse().ok()?)),
        Some(_) => (authority, None),
        None => (authority, None),
    };
    (!host.is_empty()).then(|| (host.to_ascii_lowercase(), port))
}

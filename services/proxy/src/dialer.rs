//! Target-facing boundary: name resolution and outbound connects.
//!
//! Static host overrides take precedence over DNS and can be swapped at
//! runtime without blocking dials in flight.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::session::TargetAddr;

/// Default connect timeout for target connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_TARGET_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("no target host name")]
    EmptyHost,

    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("{host} resolved to no addresses")]
    NoAddresses { host: String },

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("connect to {addr} timed out")]
    Timeout { addr: SocketAddr },
}

/// Parses `host=ip:port` pairs separated by commas.
pub fn parse_static_hosts(spec: &str) -> Result<HashMap<String, SocketAddr>, String> {
    let mut hosts = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, addr) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected host=ip:port, got '{entry}'"))?;
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid address for '{host}': {e}"))?;
        hosts.insert(normalize_host(host), addr);
    }
    Ok(hosts)
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Opens connections to targets by host name or address.
pub struct TargetDialer {
    overrides: ArcSwap<HashMap<String, SocketAddr>>,
    default_port: u16,
    connect_timeout: Duration,
    connections_attempted: AtomicU64,
    connections_succeeded: AtomicU64,
}

impl Default for TargetDialer {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_PORT, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TargetDialer {
    pub fn new(default_port: u16, connect_timeout: Duration) -> Self {
        Self {
            overrides: ArcSwap::from_pointee(HashMap::new()),
            default_port,
            connect_timeout,
            connections_attempted: AtomicU64::new(0),
            connections_succeeded: AtomicU64::new(0),
        }
    }

    pub fn with_overrides(self, overrides: HashMap<String, SocketAddr>) -> Self {
        self.set_overrides(overrides);
        self
    }

    /// Replaces the static host table.
    pub fn set_overrides(&self, overrides: HashMap<String, SocketAddr>) {
        let overrides = overrides
            .into_iter()
            .map(|(host, addr)| (normalize_host(&host), addr))
            .collect();
        self.overrides.store(Arc::new(overrides));
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Resolves `host` to one address, using `port` or the default port.
    pub async fn resolve(&self, host: &str, port: Option<u16>) -> Result<SocketAddr, DialError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(DialError::EmptyHost);
        }
        if let Some(addr) = self.overrides.load().get(&host) {
            return Ok(*addr);
        }

        let port = port.unwrap_or(self.default_port);
        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| DialError::Resolve {
                host: host.clone(),
                source,
            })?;
        let addr = addrs.next();
        drop(addrs);
        addr.ok_or(DialError::NoAddresses { host })
    }

    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        self.connections_attempted.fetch_add(1, Ordering::Relaxed);
        debug!(target_addr = %addr, "Connecting to target");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(DialError::Connect { addr, source }),
            Err(_) => return Err(DialError::Timeout { addr }),
        };
        let _ = stream.set_nodelay(true);

        self.connections_succeeded.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// Resolves and connects in one step.
    pub async fn dial(
        &self,
        host: &str,
        port: Option<u16>,
    ) -> Result<(TcpStream, TargetAddr), DialError> {
        let addr = self.resolve(host, port).await?;
        let stream = self.connect_addr(addr).await?;
        Ok((
            stream,
            TargetAddr {
                host: normalize_host(host),
                addr,
            },
        ))
    }

    /// (attempted, succeeded)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.connections_attempted.load(Ordering::Relaxed),
            self.connections_succeeded.load(Ordering::Relaxed),
        )
    }
}

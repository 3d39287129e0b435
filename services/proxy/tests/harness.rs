//! Test harness for proxy integration tests.
//!
//! Spawns edges (with an in-process or remote bridge), bridge HTTP servers
//! and scripted origins, and drives a TLS-shaped client through them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use veil_proxy::bridge::{api, Bridge, BridgeConfig};
use veil_proxy::dialer::TargetDialer;
use veil_proxy::edge::{EdgeConfig, EdgeListener};
use veil_proxy::handoff::Strategy;
use veil_proxy::handshake::HandshakeConfig;
use veil_proxy::oob::{InProcessOob, OobChannel};
use veil_proxy::session::SessionStore;
use veil_testing::target::{read_record, TargetScript};
use veil_testing::tls;

pub const ORIGIN: &str = "origin.test";

/// Origin flight: ServerHello, one encrypted handshake record, and a
/// session ticket once the client has finished.
pub fn origin_script() -> TargetScript {
    TargetScript {
        after_client_finished: vec![tls::new_session_ticket()],
        ..TargetScript::with_flight(vec![
            tls::ServerHelloBuilder::tls13().build(),
            tls::application_data(64),
        ])
    }
}

pub fn dialer_for(hosts: &[(&str, SocketAddr)]) -> Arc<TargetDialer> {
    let overrides: HashMap<String, SocketAddr> = hosts
        .iter()
        .map(|(host, addr)| (host.to_string(), *addr))
        .collect();
    Arc::new(TargetDialer::new(443, Duration::from_secs(1)).with_overrides(overrides))
}

pub fn quick_edge_config(handoff: &[Strategy]) -> EdgeConfig {
    EdgeConfig {
        handshake: HandshakeConfig {
            timeout: Duration::from_secs(3),
            first_response_timeout: Duration::from_secs(2),
            poll_wait: Duration::from_millis(50),
            empty_poll_limit: 3,
        },
        handoff: handoff.to_vec(),
        ..EdgeConfig::new("127.0.0.1:0".parse().unwrap())
    }
}

pub struct ProxyHandle {
    pub addr: SocketAddr,
    pub listener: Arc<EdgeListener>,
    pub bridge: Option<Arc<Bridge>>,
    task: JoinHandle<io::Result<()>>,
}

impl ProxyHandle {
    /// Edge and bridge in one process.
    pub async fn combined(dialer: Arc<TargetDialer>, handoff: &[Strategy]) -> io::Result<Self> {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SessionStore::new()),
            Arc::clone(&dialer),
            BridgeConfig::default(),
        ));
        let oob = Arc::new(InProcessOob::new(Arc::clone(&bridge)));
        let mut handle = Self::edge(oob, dialer, handoff).await?;
        handle.bridge = Some(bridge);
        Ok(handle)
    }

    pub async fn edge(
        oob: Arc<dyn OobChannel>,
        dialer: Arc<TargetDialer>,
        handoff: &[Strategy],
    ) -> io::Result<Self> {
        let listener = EdgeListener::bind(
            quick_edge_config(handoff),
            oob,
            dialer,
            Arc::new(SessionStore::new()),
        )
        .await?;
        let addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let task = tokio::spawn(Arc::clone(&listener).run());
        Ok(Self {
            addr,
            listener,
            bridge: None,
            task,
        })
    }

    pub fn edge_store(&self) -> &Arc<SessionStore> {
        self.listener.store()
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bridge HTTP control surface on an ephemeral port.
pub struct BridgeServer {
    pub base_url: String,
    pub bridge: Arc<Bridge>,
    task: JoinHandle<io::Result<()>>,
}

impl BridgeServer {
    pub async fn spawn(dialer: Arc<TargetDialer>) -> io::Result<Self> {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SessionStore::new()),
            dialer,
            BridgeConfig::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = api::create_router(Arc::clone(&bridge));
        let task = tokio::spawn(async move { axum::serve(listener, app).await });
        Ok(Self {
            base_url: format!("http://{addr}"),
            bridge,
            task,
        })
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sends a ClientHello for `sni` (none when `None`), reads the origin's
/// two-record flight and answers with Finished.
pub async fn client_handshake<S>(stream: &mut S, sni: Option<&str>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let builder = tls::ClientHelloBuilder::new();
    let hello = match sni {
        Some(host) => builder.sni(host).build(),
        None => builder.build(),
    };
    stream.write_all(&hello).await?;

    let server_hello = timeout(Duration::from_secs(5), read_record(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no ServerHello"))??;
    assert_eq!(server_hello, tls::ServerHelloBuilder::tls13().build());
    let encrypted = timeout(Duration::from_secs(5), read_record(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no encrypted flight"))??;
    assert_eq!(encrypted, tls::application_data(64));

    stream.write_all(&tls::finished()).await
}

/// Writes an application record until the origin echoes it back. Every
/// record read on the way is returned, the echo last.
///
/// Bytes written before the handoff settles may go to a connection that
/// is being released, so the ping is repeated.
pub async fn ping_until_echo<S>(stream: &mut S) -> io::Result<Vec<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping = tls::application_data(16);
    let mut seen = Vec::new();
    for _ in 0..10 {
        stream.write_all(&ping).await?;
        loop {
            match timeout(Duration::from_millis(300), read_record(stream)).await {
                Ok(Ok(record)) => {
                    let echoed = record == ping;
                    seen.push(record);
                    if echoed {
                        return Ok(seen);
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
    }
    Err(io::Error::new(io::ErrorKind::TimedOut, "ping never echoed"))
}

/// True once the peer has closed `stream`.
pub async fn closed_within(stream: &mut TcpStream, wait: Duration) -> bool {
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

/// Polls `condition` every 10ms until it holds or `wait` runs out.
pub async fn eventually<F>(wait: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

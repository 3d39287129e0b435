//! Edge TCP listener and per-connection flow.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use veil_id::{ConnectionId, SessionId};
use veil_tls::{extract_sni, parse_record_header, ContentType};

use super::passthrough::relay_direct;
use super::preamble::{read_preamble, Preamble, PreambleConfig};
use super::ConnectionError;
use crate::dialer::TargetDialer;
use crate::handoff::{Handoff, Strategy, DEFAULT_ORDER};
use crate::handshake::{HandshakeConfig, HandshakeDriver};
use crate::oob::OobChannel;
use crate::relay::{Relay, RelayConfig, RelayStats};
use crate::session::{Session, SessionStore, TargetAddr, TargetLink};

/// Default maximum concurrent client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Plain HTTP targets without an explicit port.
const HTTP_PORT: u16 = 80;

/// Stands in for a target address the edge never learned.
const UNKNOWN_PEER: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub preamble: PreambleConfig,
    pub handshake: HandshakeConfig,
    pub relay: RelayConfig,
    /// Handoff strategies in preference order.
    pub handoff: Vec<Strategy>,
}

impl EdgeConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            preamble: PreambleConfig::default(),
            handshake: HandshakeConfig::default(),
            relay: RelayConfig::default(),
            handoff: DEFAULT_ORDER.to_vec(),
        }
    }
}

/// Statistics for the edge listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    pub sni_found: AtomicU64,
    pub sni_missing: AtomicU64,
    /// Handshakes relayed through the OOB channel.
    pub handshakes_relayed: AtomicU64,
    /// Connections sent straight to their target because the OOB channel
    /// was unavailable.
    pub direct_fallbacks: AtomicU64,
    /// Plain HTTP and non-TLS tunnels.
    pub passthrough: AtomicU64,
    pub handoffs_failed: AtomicU64,
    pub bytes_to_target: AtomicU64,
    pub bytes_from_target: AtomicU64,
}

impl ListenerStats {
    fn record_relay(&self, stats: RelayStats) {
        self.bytes_to_target.fetch_add(stats.a_to_b, Ordering::Relaxed);
        self.bytes_from_target
            .fetch_add(stats.b_to_a, Ordering::Relaxed);
    }
}

/// Accepts client connections for the proxy.
pub struct EdgeListener {
    config: EdgeConfig,
    listener: TcpListener,
    oob: Arc<dyn OobChannel>,
    dialer: Arc<TargetDialer>,
    /// Edge-side sessions, one per TLS or passthrough connection.
    store: Arc<SessionStore>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl EdgeListener {
    pub async fn bind(
        config: EdgeConfig,
        oob: Arc<dyn OobChannel>,
        dialer: Arc<TargetDialer>,
        store: Arc<SessionStore>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            handoff = ?config.handoff,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            oob,
            dialer,
            store,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Accepts clients until the listener fails for good. Each client gets
    /// a connection slot and its own task; clients beyond
    /// `max_connections` are dropped at accept.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(bind_addr = %self.listener.local_addr()?, "Listener started");

        loop {
            let (client, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let Ok(slot) = Arc::clone(&self.conn_semaphore).try_acquire_owned() else {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer, "Connection rejected: max connections reached");
                continue;
            };

            let span = info_span!("connection", conn_id = %ConnectionId::new(), peer = %peer);
            tokio::spawn(Arc::clone(&self).serve(client, slot).instrument(span));
        }
    }

    /// One client from accept to close. The slot is free again before the
    /// connection counts as closed.
    async fn serve(self: Arc<Self>, client: TcpStream, slot: OwnedSemaphorePermit) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        match self.handle_connection(client).await {
            Ok(()) => debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Connection closed"),
            Err(ConnectionError::Preamble(e)) => debug!(error = %e, "No usable preamble"),
            Err(e) => debug!(
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Connection ended with error"
            ),
        }

        drop(slot);
        self.stats
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
        self.stats
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
    }

    async fn handle_connection(&self, mut client: TcpStream) -> Result<(), ConnectionError> {
        let _ = client.set_nodelay(true);
        let preamble = read_preamble(&mut client, &self.config.preamble).await?;

        let (hello, connect_target) = match preamble {
            Preamble::Tls { hello } => (hello, None),
            Preamble::Connect { host, port, first } if opens_with_handshake(&first) => {
                (first, Some((host, port)))
            }
            Preamble::Connect { host, port, first } => {
                return self.passthrough(client, &host, Some(port), first).await;
            }
            Preamble::Http { host, port, head } => {
                return self
                    .passthrough(client, &host, Some(port.unwrap_or(HTTP_PORT)), head)
                    .await;
            }
        };

        let sni = match extract_sni(&hello) {
            Ok(sni) => {
                self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                debug!(sni = %sni, "SNI extracted");
                Some(sni)
            }
            Err(e) => {
                self.stats.sni_missing.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "No SNI in ClientHello");
                None
            }
        };
        let target_name = sni
            .clone()
            .or_else(|| connect_target.as_ref().map(|(host, _)| host.clone()))
            .ok_or(ConnectionError::NoTarget)?;
        let target_port = connect_target.map(|(_, port)| port);

        let session = self
            .store
            .create(SessionId::new(), sni.as_deref().unwrap_or_default())?;
        let id = session.id();
        session.append_client_message(hello.clone()).await;

        let result = self
            .conceal(&session, client, &target_name, target_port, hello)
            .instrument(info_span!("session", session_id = %id, target = %target_name))
            .await;
        self.store.remove(&id).await;
        result
    }

    /// Relays the handshake through the OOB channel, hands the connection
    /// off, and relays application data until either side closes.
    async fn conceal(
        &self,
        session: &Session,
        mut client: TcpStream,
        target_name: &str,
        target_port: Option<u16>,
        hello: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let id = session.id();

        match self.oob.initiate_handshake(id, target_name, &hello).await {
            Ok(()) => {}
            Err(e) if e.is_fallback_trigger() => {
                warn!(error = %e, "OOB channel unavailable; connecting to target without concealment");
                self.stats.direct_fallbacks.fetch_add(1, Ordering::Relaxed);
                let stats = relay_direct(
                    session,
                    client,
                    &self.dialer,
                    target_name,
                    target_port,
                    &hello,
                    &self.config.relay,
                )
                .await?;
                self.stats.record_relay(stats);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.stats
            .handshakes_relayed
            .fetch_add(1, Ordering::Relaxed);

        let driver = HandshakeDriver::new(
            self.oob.as_ref(),
            session,
            &self.config.handshake,
            &self.config.relay,
        );
        match driver.run(&mut client).await {
            Ok(_) => {
                session.mark_complete().await;
                if let Err(e) = self.oob.signal_completion(id).await {
                    debug!(error = %e, "Failed to signal handshake completion");
                }
                match self.oob.target_info(id).await {
                    Ok(info) => {
                        debug!(
                            target_ip = %info.target_ip,
                            target_port = info.target_port,
                            tls_version = %info.tls_version,
                            "Target negotiated"
                        );
                        if let Some(addr) = info.socket_addr() {
                            session
                                .set_target_addr(TargetAddr {
                                    host: info.target_host,
                                    addr,
                                })
                                .await;
                        }
                    }
                    Err(e) => debug!(error = %e, "Target info unavailable"),
                }
            }
            Err(e) if e.falls_back() => {
                warn!(error = %e, "Handshake relay interrupted; trying handoff");
            }
            Err(e) => {
                self.oob.close_session(id).await;
                return Err(e.into());
            }
        }

        let handoff = Handoff::new(self.oob.as_ref(), &self.dialer, &self.config.handoff);
        let Some((strategy, target)) = handoff.acquire(id).await else {
            self.stats.handoffs_failed.fetch_add(1, Ordering::Relaxed);
            self.oob.close_session(id).await;
            return Err(ConnectionError::HandoffExhausted);
        };

        // The bridge lets go of anything the chosen strategy did not take.
        let oob = Arc::clone(&self.oob);
        tokio::spawn(async move { oob.release_connection(id).await });

        let peer = session
            .target_addr()
            .await
            .map(|t| t.addr)
            .unwrap_or(UNKNOWN_PEER);
        let (link, shutdown) = TargetLink::detached(peer);
        session.set_target(link).await;

        let stats = Relay::new(self.config.relay.clone())
            .label(strategy.as_str())
            .activity(session.activity().clone())
            .shutdown(shutdown)
            .run(client, target)
            .await;
        // An adopted connection leaves an empty session behind on the bridge.
        self.oob.close_session(id).await;
        let stats = stats?;
        debug!(
            strategy = %strategy,
            to_target = stats.a_to_b,
            from_target = stats.b_to_a,
            "Connection finished"
        );
        self.stats.record_relay(stats);
        Ok(())
    }

    /// Plain HTTP or a non-TLS tunnel: straight to the named target.
    async fn passthrough(
        &self,
        client: TcpStream,
        host: &str,
        port: Option<u16>,
        head: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.stats.passthrough.fetch_add(1, Ordering::Relaxed);
        let session = self.store.create(SessionId::new(), "")?;
        let id = session.id();
        session.append_client_message(head.clone()).await;

        let result = relay_direct(
            &session,
            client,
            &self.dialer,
            host,
            port,
            &head,
            &self.config.relay,
        )
        .instrument(info_span!("passthrough", session_id = %id, target = %host))
        .await;
        self.store.remove(&id).await;
        self.stats.record_relay(result?);
        Ok(())
    }
}

/// True when `bytes` start with a TLS Handshake record header.
fn opens_with_handshake(bytes: &[u8]) -> bool {
    parse_record_header(bytes)
        .is_ok_and(|h| h.kind() == Some(ContentType::Handshake) && h.looks_like_tls())
}

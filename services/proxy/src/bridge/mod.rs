//! Handshake Relay Protocol, target side.
//!
//! The [`Bridge`] owns the target connection for each session. It forwards
//! client handshake bytes to the target, buffers whole target records for
//! the edge to poll, and at handoff either gives the socket away
//! ([`Bridge::adopt_connection`]) or keeps it and relays a tunnel
//! ([`Bridge::prepare_tunnel`] and [`Bridge::spawn_relay`]).

pub mod api;
mod reader;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn, Instrument};
use veil_id::SessionId;
use veil_proto::{ServerMessage, TargetInfo};
use veil_tls::{any_record, detect_tls_version, is_handshake_complete};

use crate::dialer::TargetDialer;
use crate::oob::OobError;
use crate::relay::{Relay, RelayConfig};
use crate::session::{Session, SessionStore, TargetLink};

/// Longest a single poll may wait, whatever the caller asks for.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on each write to a target during the handshake.
    pub write_timeout: Duration,
    /// How long a completed session waits to be adopted or released before
    /// it is closed.
    pub completion_grace: Duration,
    pub relay: RelayConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            completion_grace: Duration::from_secs(30),
            relay: RelayConfig::default(),
        }
    }
}

pub struct Bridge {
    store: Arc<SessionStore>,
    dialer: Arc<TargetDialer>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(store: Arc<SessionStore>, dialer: Arc<TargetDialer>, config: BridgeConfig) -> Self {
        Self {
            store,
            dialer,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn dialer(&self) -> &Arc<TargetDialer> {
        &self.dialer
    }

    /// Creates the session, connects to the target named by `sni`, writes
    /// the ClientHello and starts the target reader. A failed connect
    /// leaves no session behind.
    #[instrument(skip(self, client_hello), fields(session_id = %id, sni = %sni))]
    pub async fn initiate_handshake(
        &self,
        id: SessionId,
        sni: &str,
        client_hello: Vec<u8>,
    ) -> Result<(), OobError> {
        let session = self.store.create(id, sni)?;
        if let Err(e) = self.attach_target(&session, client_hello).await {
            warn!(error = %e, "Failed to open target connection");
            self.store.remove(&id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn attach_target(
        &self,
        session: &Arc<Session>,
        client_hello: Vec<u8>,
    ) -> Result<(), OobError> {
        let (stream, target) = self.dialer.dial(session.sni(), None).await?;
        let peer = target.addr;
        let (read, mut write) = stream.into_split();

        match tokio::time::timeout(self.config.write_timeout, write.write_all(&client_hello)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(OobError::Target(format!("write to {peer}: {e}"))),
            Err(_) => return Err(OobError::Target(format!("write to {peer} timed out"))),
        }

        session.append_client_message(client_hello).await;
        session.set_target_addr(target).await;
        let reader = reader::spawn(Arc::clone(session), read);
        session
            .set_target(TargetLink::attached(peer, write, reader))
            .await;

        info!(target_addr = %peer, "Target connection opened");
        Ok(())
    }

    pub async fn next_server_message(
        &self,
        id: SessionId,
        wait: Duration,
    ) -> Result<ServerMessage, OobError> {
        let session = self.store.require(&id)?;
        Ok(session.wait_for_response(wait.min(MAX_POLL_WAIT)).await)
    }

    /// Forwards client bytes to the target. A message that completes the
    /// handshake parks the target reader first, so whatever the target
    /// sends afterwards stays in the socket for the next owner.
    #[instrument(skip(self, data), fields(session_id = %id, bytes = data.len()))]
    pub async fn send_client_message(
        &self,
        id: SessionId,
        data: Vec<u8>,
    ) -> Result<bool, OobError> {
        let session = self.store.require(&id)?;
        if session.is_adopted().await {
            return Err(OobError::Protocol(format!("session {id} has been handed off")));
        }

        let completes = any_record(&data, is_handshake_complete);
        if completes {
            session.mark_complete().await;
            session.park_reader().await;
            debug!("Client message completes the handshake");
        }

        session
            .write_to_target(&data, self.config.write_timeout)
            .await
            .map_err(|e| OobError::Target(e.to_string()))?;
        session.append_client_message(data).await;

        Ok(completes || session.is_complete().await)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn complete_handshake(&self, id: SessionId) -> Result<(), OobError> {
        let session = self.store.require(&id)?;
        if session.mark_complete().await {
            debug!("Handshake marked complete");
        }
        session.park_reader().await;
        self.schedule_grace_close(id);
        Ok(())
    }

    fn schedule_grace_close(&self, id: SessionId) {
        let store = Arc::clone(&self.store);
        let grace = self.config.completion_grace;
        tokio::spawn(
            async move {
                tokio::time::sleep(grace).await;
                let Some(session) = store.get(&id) else {
                    return;
                };
                if session.is_adopted().await {
                    return;
                }
                if store.remove(&id).await.is_some() {
                    info!("Closed unclaimed session after completion grace period");
                }
            }
            .instrument(tracing::debug_span!("completion_grace", session_id = %id)),
        );
    }

    pub async fn target_info(&self, id: SessionId) -> Result<TargetInfo, OobError> {
        let session = self.store.require(&id)?;
        if !session.is_complete().await {
            return Err(OobError::HandshakeIncomplete(id));
        }
        let target = session
            .target_addr()
            .await
            .ok_or_else(|| OobError::Target(format!("session {id} has no resolved target")))?;

        let tls_version = session
            .server_responses()
            .await
            .iter()
            .find_map(|record| detect_tls_version(record).ok())
            .map(|version| version.to_string())
            .unwrap_or_default();

        Ok(TargetInfo {
            target_host: target.host,
            target_ip: target.addr.ip().to_string(),
            target_port: target.addr.port(),
            sni: session.sni().to_string(),
            tls_version,
        })
    }

    /// Hands the target socket to the caller. Every response not yet
    /// delivered is discarded; the caller reads fresh from the socket.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn adopt_connection(&self, id: SessionId) -> Result<TcpStream, OobError> {
        let session = self.store.require(&id)?;
        if !session.is_complete().await {
            return Err(OobError::HandshakeIncomplete(id));
        }
        if session.is_adopted().await {
            return Err(OobError::Protocol(format!("session {id} already adopted")));
        }

        let discarded = session.mark_adopted().await;
        let stream = session.take_stream().await?;
        info!(discarded, "Target connection adopted");
        Ok(stream)
    }

    /// Takes the target socket for a bridge-side tunnel. Returns it with the
    /// undelivered responses concatenated, to be written to the tunnel
    /// before relaying starts.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn prepare_tunnel(&self, id: SessionId) -> Result<(TcpStream, Vec<u8>), OobError> {
        let session = self.store.require(&id)?;
        let stream = session.take_stream().await?;
        let pending = session.take_undelivered().await.concat();
        session.mark_adopted().await;
        info!(pending_bytes = pending.len(), "Tunnel prepared");
        Ok((stream, pending))
    }

    /// Relays `peer` to `target` on a background task. The session keeps a
    /// detached link to the task and is removed when the relay ends.
    pub fn spawn_relay<S>(&self, id: SessionId, target: TcpStream, prefix: Vec<u8>, peer: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let store = Arc::clone(&self.store);
        let config = self.config.relay.clone();
        tokio::spawn(
            async move {
                let Some(session) = store.get(&id) else {
                    debug!("Session closed before relay started");
                    return;
                };
                let peer_addr = match session.target_addr().await {
                    Some(target) => target.addr,
                    None => target
                        .peer_addr()
                        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0))),
                };
                let (link, shutdown) = TargetLink::detached(peer_addr);
                session.set_target(link).await;

                let mut peer = peer;
                if !prefix.is_empty() {
                    if let Err(e) = peer.write_all(&prefix).await {
                        debug!(error = %e, "Failed to write pending responses to tunnel");
                        store.remove(&id).await;
                        return;
                    }
                }

                match Relay::new(config)
                    .label("bridge")
                    .activity(session.activity().clone())
                    .shutdown(shutdown)
                    .run(peer, target)
                    .await
                {
                    Ok(stats) => debug!(
                        to_target = stats.a_to_b,
                        from_target = stats.b_to_a,
                        "Bridge relay finished"
                    ),
                    Err(e) => debug!(error = %e, "Bridge relay ended with error"),
                }
                store.remove(&id).await;
            }
            .instrument(tracing::info_span!("bridge_relay", session_id = %id)),
        );
    }

    /// Closes the session unless its connection has been handed off, in
    /// which case the relay owning it is left alone.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn release_connection(&self, id: SessionId) {
        let Some(session) = self.store.get(&id) else {
            debug!("Release for unknown session");
            return;
        };
        if session.is_adopted().await {
            debug!("Release after handoff; connection stays with its relay");
            return;
        }
        self.store.remove(&id).await;
    }

    pub async fn close_session(&self, id: SessionId) {
        if self.store.remove(&id).await.is_some() {
            debug!(session_id = %id, "Session closed");
        }
    }
}

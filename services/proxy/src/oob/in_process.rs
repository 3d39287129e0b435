use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use veil_id::SessionId;
use veil_proto::{ServerMessage, TargetInfo};

use super::{BoxedStream, OobChannel, OobError};
use crate::bridge::Bridge;

/// Buffer size of the in-memory pipe backing a tunnel.
const TUNNEL_PIPE_CAPACITY: usize = 64 * 1024;

/// Calls a [`Bridge`] living in the same process.
#[derive(Clone)]
pub struct InProcessOob {
    bridge: Arc<Bridge>,
}

impl InProcessOob {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

#[async_trait]
impl OobChannel for InProcessOob {
    async fn initiate_handshake(
        &self,
        id: SessionId,
        sni: &str,
        client_hello: &[u8],
    ) -> Result<(), OobError> {
        self.bridge
            .initiate_handshake(id, sni, client_hello.to_vec())
            .await
    }

    async fn next_server_message(
        &self,
        id: SessionId,
        wait: Duration,
    ) -> Result<ServerMessage, OobError> {
        self.bridge.next_server_message(id, wait).await
    }

    async fn send_client_message(&self, id: SessionId, data: &[u8]) -> Result<bool, OobError> {
        self.bridge.send_client_message(id, data.to_vec()).await
    }

    async fn signal_completion(&self, id: SessionId) -> Result<(), OobError> {
        self.bridge.complete_handshake(id).await
    }

    async fn target_info(&self, id: SessionId) -> Result<TargetInfo, OobError> {
        self.bridge.target_info(id).await
    }

    async fn adopt_connection(&self, id: SessionId) -> Result<BoxedStream, OobError> {
        let stream = self.bridge.adopt_connection(id).await?;
        Ok(Box::new(stream))
    }

    async fn open_tunnel(&self, id: SessionId) -> Result<BoxedStream, OobError> {
        let (target, pending) = self.bridge.prepare_tunnel(id).await?;
        let (near, far) = tokio::io::duplex(TUNNEL_PIPE_CAPACITY);
        self.bridge.spawn_relay(id, target, pending, far);
        Ok(Box::new(near))
    }

    async fn release_connection(&self, id: SessionId) {
        self.bridge.release_connection(id).await;
    }

    async fn close_session(&self, id: SessionId) {
        self.bridge.close_session(id).await;
    }
}

//! OOB Channel.
//!
//! The edge drives the handshake relay through an [`OobChannel`] without
//! knowing whether the bridge lives in the same process
//! ([`InProcessOob`]) or behind an HTTP control connection
//! ([`RemoteOob`]).

mod error;
mod in_process;
mod remote;

pub use error::OobError;
pub use in_process::InProcessOob;
pub use remote::{RemoteOob, RemoteOobConfig};

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use veil_id::SessionId;
use veil_proto::{ServerMessage, TargetInfo};

/// A byte stream handed over by the bridge.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

pub type BoxedStream = Box<dyn RawStream>;

/// Operations the edge needs from the target-facing side.
#[async_trait]
pub trait OobChannel: Send + Sync {
    /// Opens the target connection for `sni`, forwards `client_hello`, and
    /// starts collecting target responses. Not safe to retry.
    async fn initiate_handshake(
        &self,
        id: SessionId,
        sni: &str,
        client_hello: &[u8],
    ) -> Result<(), OobError>;

    /// Next undelivered server response, waiting up to `wait` for one.
    async fn next_server_message(
        &self,
        id: SessionId,
        wait: Duration,
    ) -> Result<ServerMessage, OobError>;

    /// Forwards client handshake bytes. Returns whether the handshake is now
    /// complete.
    async fn send_client_message(&self, id: SessionId, data: &[u8]) -> Result<bool, OobError>;

    async fn signal_completion(&self, id: SessionId) -> Result<(), OobError>;

    async fn target_info(&self, id: SessionId) -> Result<TargetInfo, OobError>;

    /// Takes over the target connection as a raw stream. Responses not yet
    /// delivered are discarded.
    async fn adopt_connection(&self, id: SessionId) -> Result<BoxedStream, OobError>;

    /// Opens a fresh stream relayed by the bridge to the target. Responses
    /// not yet delivered are written to the stream first.
    async fn open_tunnel(&self, id: SessionId) -> Result<BoxedStream, OobError>;

    /// Best effort; failures are logged.
    async fn release_connection(&self, id: SessionId);

    /// Best effort; failures are logged.
    async fn close_session(&self, id: SessionId);
}

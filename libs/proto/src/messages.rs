use serde::{Deserialize, Serialize};
use veil_id::SessionId;

/// Body of `POST /v1/sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateHandshakeRequest {
    pub session_id: SessionId,
    /// Empty when the ClientHello carried no usable SNI.
    #[serde(default)]
    pub sni: String,
    #[serde(with = "crate::bytes")]
    pub client_hello: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
}

/// Query of `GET /v1/sessions/{id}/next`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextServerMessageQuery {
    /// How long the bridge may hold the request waiting for a response.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// One server handshake response, or an empty body once everything
/// buffered has been delivered and the handshake is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(with = "crate::bytes")]
    pub data: Vec<u8>,
    pub handshake_complete: bool,
}

impl ServerMessage {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessageRequest {
    #[serde(with = "crate::bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessageResponse {
    pub handshake_complete: bool,
}

/// Resolved facts about a session's target connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_host: String,
    pub target_ip: String,
    pub target_port: u16,
    pub sni: String,
    /// Negotiated version as "1.2", "1.3", or "0x...." when unrecognised.
    /// Empty when the ServerHello could not be parsed.
    pub tls_version: String,
}

impl TargetInfo {
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        let ip: std::net::IpAddr = self.target_ip.parse().ok()?;
        Some(std::net::SocketAddr::new(ip, self.target_port))
    }
}

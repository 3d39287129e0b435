//! OOB channel over the bridge's HTTP control surface.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONNECTION, UPGRADE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use veil_id::SessionId;
use veil_proto::{
    check_upgrade, problem_codes, routes, ClientMessageRequest, ClientMessageResponse,
    InitiateHandshakeRequest, ProblemDetails, ServerMessage, TargetInfo, UPGRADE_PROTOCOL,
};

use super::{BoxedStream, OobChannel, OobError};

#[derive(Debug, Clone)]
pub struct RemoteOobConfig {
    /// Bridge base URL, e.g. `http://10.0.0.2:9443`.
    pub base_url: String,
    /// Per-request timeout. Long polls get their wait added on top.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RemoteOobConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9443".to_string(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Bridge client.
pub struct RemoteOob {
    client: reqwest::Client,
    /// HTTP/1.1 only and never pooled: an upgraded connection is gone for
    /// good once handed over.
    upgrade_client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl RemoteOob {
    pub fn new(config: RemoteOobConfig) -> Result<Self, OobError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| OobError::Transport(format!("failed to build HTTP client: {e}")))?;
        let upgrade_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .http1_only()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| OobError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            upgrade_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(
        &self,
        id: SessionId,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, OobError> {
        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(id, response).await)
        }
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        id: SessionId,
        request: reqwest::RequestBuilder,
    ) -> Result<T, OobError> {
        self.execute(id, request)
            .await?
            .json()
            .await
            .map_err(transport_error)
    }

    /// POSTs to a raw-stream endpoint and switches the connection over.
    async fn upgrade(&self, id: SessionId, path: String) -> Result<BoxedStream, OobError> {
        let request = self
            .upgrade_client
            .post(self.url(&path))
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, UPGRADE_PROTOCOL);

        let response = match tokio::time::timeout(self.request_timeout, request.send()).await {
            Ok(response) => response.map_err(transport_error)?,
            Err(_) => return Err(OobError::Timeout),
        };

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            if status.is_success() {
                return Err(OobError::Protocol(format!(
                    "expected 101 Switching Protocols, got {status}"
                )));
            }
            return Err(status_error(id, response).await);
        }

        let offered = response
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok());
        check_upgrade(offered).map_err(|e| OobError::Protocol(e.to_string()))?;

        let upgraded = response.upgrade().await.map_err(transport_error)?;
        debug!(session_id = %id, path = %path, "Control connection upgraded");
        Ok(Box::new(upgraded))
    }
}

fn transport_error(e: reqwest::Error) -> OobError {
    if e.is_timeout() {
        OobError::Timeout
    } else if e.is_decode() {
        OobError::Protocol(format!("undecodable response: {e}"))
    } else {
        OobError::Transport(e.to_string())
    }
}

async fn status_error(id: SessionId, response: reqwest::Response) -> OobError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let problem = ProblemDetails::from_slice(&body).ok();
    let code = problem.as_ref().map(|p| p.code.as_str()).unwrap_or("");
    let detail = problem
        .as_ref()
        .map(|p| p.detail.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());

    match (status, code) {
        (StatusCode::NOT_FOUND, problem_codes::SESSION_NOT_FOUND) => OobError::SessionNotFound(id),
        (StatusCode::BAD_REQUEST, problem_codes::HANDSHAKE_INCOMPLETE) => {
            OobError::HandshakeIncomplete(id)
        }
        (StatusCode::CONFLICT, _) => OobError::SessionExists(id),
        (StatusCode::BAD_GATEWAY, _) => OobError::Target(detail),
        (StatusCode::GATEWAY_TIMEOUT, _) => OobError::Timeout,
        _ => OobError::Protocol(format!("unexpected status {status}: {detail}")),
    }
}

#[async_trait]
impl OobChannel for RemoteOob {
    async fn initiate_handshake(
        &self,
        id: SessionId,
        sni: &str,
        client_hello: &[u8],
    ) -> Result<(), OobError> {
        let body = InitiateHandshakeRequest {
            session_id: id,
            sni: sni.to_string(),
            client_hello: client_hello.to_vec(),
        };
        self.execute(id, self.client.post(self.url(routes::SESSIONS)).json(&body))
            .await?;
        Ok(())
    }

    async fn next_server_message(
        &self,
        id: SessionId,
        wait: Duration,
    ) -> Result<ServerMessage, OobError> {
        let path = routes::next(&id, wait.as_millis() as u64);
        let request = self
            .client
            .get(self.url(&path))
            .timeout(self.request_timeout + wait);
        self.execute_json(id, request).await
    }

    async fn send_client_message(&self, id: SessionId, data: &[u8]) -> Result<bool, OobError> {
        let body = ClientMessageRequest {
            data: data.to_vec(),
        };
        let request = self
            .client
            .post(self.url(&routes::client_messages(&id)))
            .json(&body);
        let response: ClientMessageResponse = self.execute_json(id, request).await?;
        Ok(response.handshake_complete)
    }

    async fn signal_completion(&self, id: SessionId) -> Result<(), OobError> {
        self.execute(id, self.client.post(self.url(&routes::complete(&id))))
            .await?;
        Ok(())
    }

    async fn target_info(&self, id: SessionId) -> Result<TargetInfo, OobError> {
        self.execute_json(id, self.client.get(self.url(&routes::target(&id))))
            .await
    }

    async fn adopt_connection(&self, id: SessionId) -> Result<BoxedStream, OobError> {
        self.upgrade(id, routes::adopt(&id)).await
    }

    async fn open_tunnel(&self, id: SessionId) -> Result<BoxedStream, OobError> {
        self.upgrade(id, routes::tunnel(&id)).await
    }

    async fn release_connection(&self, id: SessionId) {
        let request = self.client.post(self.url(&routes::release(&id)));
        if let Err(e) = self.execute(id, request).await {
            warn!(session_id = %id, error = %e, "Failed to release bridge connection");
        }
    }

    async fn close_session(&self, id: SessionId) {
        let request = self.client.delete(self.url(&routes::session(&id)));
        if let Err(e) = self.execute(id, request).await {
            debug!(session_id = %id, error = %e, "Failed to close bridge session");
        }
    }
}

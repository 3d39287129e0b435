//! Bridge HTTP control surface.
//!
//! JSON endpoints mirror the [`Bridge`] operations one to one. `adopt` and
//! `tunnel` answer `101 Switching Protocols` and carry raw target bytes over
//! the upgraded connection from then on.

pub mod error;
mod health;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn, Instrument};
use veil_id::SessionId;
use veil_proto::{
    check_upgrade, problem_codes, routes, ClientMessageRequest, ClientMessageResponse,
    InitiateHandshakeRequest, NextServerMessageQuery, ServerMessage, SessionCreated, TargetInfo,
    UPGRADE_PROTOCOL,
};

use self::error::ApiError;
use super::Bridge;

pub use health::HealthResponse;

pub fn create_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .merge(health::routes())
        .route(routes::SESSIONS, post(initiate_handshake))
        .route(routes::SESSION_ROUTE, delete(close_session))
        .route(routes::NEXT_ROUTE, get(next_server_message))
        .route(routes::CLIENT_MESSAGES_ROUTE, post(send_client_message))
        .route(routes::COMPLETE_ROUTE, post(complete_handshake))
        .route(routes::TARGET_ROUTE, get(target_info))
        .route(routes::ADOPT_ROUTE, post(adopt_connection))
        .route(routes::TUNNEL_ROUTE, post(open_tunnel))
        .route(routes::RELEASE_ROUTE, post(release_connection))
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse().map_err(|e| {
        ApiError::bad_request(problem_codes::BAD_REQUEST, format!("invalid session id: {e}"))
    })
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request(problem_codes::BAD_REQUEST, e.body_text()))
}

async fn initiate_handshake(
    State(bridge): State<Arc<Bridge>>,
    payload: Result<Json<InitiateHandshakeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(payload)?;
    let id = request.session_id;
    bridge
        .initiate_handshake(id, &request.sni, request.client_hello)
        .await
        .map_err(|e| ApiError::from(e).with_instance(routes::session(&id)))?;
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id: id })))
}

async fn next_server_message(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
    Query(query): Query<NextServerMessageQuery>,
) -> Result<Json<ServerMessage>, ApiError> {
    let id = parse_id(&id)?;
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0));
    Ok(Json(bridge.next_server_message(id, wait).await?))
}

async fn send_client_message(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
    payload: Result<Json<ClientMessageRequest>, JsonRejection>,
) -> Result<Json<ClientMessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let request = json_body(payload)?;
    let handshake_complete = bridge.send_client_message(id, request.data).await?;
    Ok(Json(ClientMessageResponse { handshake_complete }))
}

async fn complete_handshake(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    bridge.complete_handshake(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn target_info(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> Result<Json<TargetInfo>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(bridge.target_info(id).await?))
}

async fn release_connection(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    bridge.release_connection(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_session(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    bridge.close_session(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn adopt_connection(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    require_upgrade(&req)?;
    let target = bridge.adopt_connection(id).await?;
    Ok(switch_protocols(bridge, id, target, Vec::new(), req))
}

async fn open_tunnel(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    require_upgrade(&req)?;
    let (target, pending) = bridge.prepare_tunnel(id).await?;
    Ok(switch_protocols(bridge, id, target, pending, req))
}

fn require_upgrade(req: &Request) -> Result<(), ApiError> {
    let offered = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok());
    check_upgrade(offered)
        .map_err(|e| ApiError::bad_request(problem_codes::BAD_REQUEST, e.to_string()))
}

/// Answers 101 and, once the client side of the upgrade completes, relays
/// the upgraded connection to the target.
fn switch_protocols(
    bridge: Arc<Bridge>,
    id: SessionId,
    target: TcpStream,
    pending: Vec<u8>,
    mut req: Request,
) -> Response {
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!("Control connection upgraded");
                    bridge.spawn_relay(id, target, pending, TokioIo::new(upgraded));
                }
                Err(e) => {
                    warn!(error = %e, "Upgrade failed");
                    bridge.close_session(id).await;
                }
            }
        }
        .instrument(tracing::info_span!("upgrade", session_id = %id)),
    );

    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response
}

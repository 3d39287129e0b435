//! Control surface paths.
//!
//! The `*_ROUTE` constants are axum path patterns; the functions build
//! concrete request paths for a session.

use veil_id::SessionId;

pub const HEALTH: &str = "/healthz";
pub const SESSIONS: &str = "/v1/sessions";

pub const SESSION_ROUTE: &str = "/v1/sessions/{id}";
pub const NEXT_ROUTE: &str = "/v1/sessions/{id}/next";
pub const CLIENT_MESSAGES_ROUTE: &str = "/v1/sessions/{id}/client-messages";
pub const COMPLETE_ROUTE: &str = "/v1/sessions/{id}/complete";
pub const TARGET_ROUTE: &str = "/v1/sessions/{id}/target";
pub const ADOPT_ROUTE: &str = "/v1/sessions/{id}/adopt";
pub const TUNNEL_ROUTE: &str = "/v1/sessions/{id}/tunnel";
pub const RELEASE_ROUTE: &str = "/v1/sessions/{id}/release";

fn session_path(pattern: &str, id: &SessionId) -> String {
    pattern.replace("{id}", &id.to_string())
}

pub fn session(id: &SessionId) -> String {
    session_path(SESSION_ROUTE, id)
}

pub fn next(id: &SessionId, wait_ms: u64) -> String {
    format!("{}?wait_ms={wait_ms}", session_path(NEXT_ROUTE, id))
}

pub fn client_messages(id: &SessionId) -> String {
    session_path(CLIENT_MESSAGES_ROUTE, id)
}

pub fn complete(id: &SessionId) -> String {
    session_path(COMPLETE_ROUTE, id)
}

pub fn target(id: &SessionId) -> String {
    session_path(TARGET_ROUTE, id)
}

pub fn adopt(id: &SessionId) -> String {
    session_path(ADOPT_ROUTE, id)
}

pub fn tunnel(id: &SessionId) -> String {
    session_path(TUNNEL_ROUTE, id)
}

pub fn release(id: &SessionId) -> String {
    session_path(RELEASE_ROUTE, id)
}

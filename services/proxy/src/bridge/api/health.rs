//! Health check endpoints for the bridge control surface.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use veil_proto::routes;

use crate::bridge::Bridge;
use crate::session::StoreStats;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<SessionHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct SessionHealth {
    pub active: usize,
    pub created: u64,
    pub removed: u64,
    pub connections_closed: u64,
}

impl From<StoreStats> for SessionHealth {
    fn from(stats: StoreStats) -> Self {
        Self {
            active: stats.active,
            created: stats.created,
            removed: stats.removed,
            connections_closed: stats.connections_closed,
        }
    }
}

pub fn routes() -> Router<Arc<Bridge>> {
    Router::new()
        .route(routes::HEALTH, get(healthz))
        .route("/livez", get(livez))
}

async fn healthz(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "veil-bridge".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        sessions: Some(bridge.store().stats().into()),
    })
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

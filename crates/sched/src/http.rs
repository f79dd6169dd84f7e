// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Boundary HTTP surface: health plus the edge WebSocket endpoint.
//!
//! Everything else (workflow CRUD, gRPC framing, OpenAPI) lives outside
//! the core; this router is only what the scheduler needs to accept an
//! edge connection.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::services::Services;

pub fn build_router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/ws/schedule", get(edge_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

async fn health(State(services): State<Arc<Services>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": services.config.service_name,
        "env": services.config.env_name,
    }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(serde_json::json!({"code": code, "message": message}))).into_response()
}

/// Edge handshake: the lab's access-key/secret pair plus the edge-chosen
/// session token, all in headers. A second connection while the heartbeat
/// key holds a different token is refused after the upgrade.
async fn edge_ws(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(access_key) = header(&headers, "access-key") else {
        return error_response(StatusCode::UNAUTHORIZED, "unauthenticated", "missing access-key");
    };
    let Some(access_secret) = header(&headers, "access-secret") else {
        return error_response(StatusCode::UNAUTHORIZED, "unauthenticated", "missing access-secret");
    };
    let Some(edge_token) = header(&headers, "edgesession").map(str::to_owned) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid-argument", "missing EdgeSession");
    };

    let identity = match services.auth.authenticate(access_key, access_secret) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!("edge auth failed: {e}");
            return error_response(StatusCode::UNAUTHORIZED, e.code(), "invalid lab credentials");
        }
    };

    let cluster = Arc::clone(&services.cluster);
    ws.on_upgrade(move |socket| cluster.handle_edge(socket, identity, edge_token))
}

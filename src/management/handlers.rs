//! Management API Handlers

use super::types::*;
use crate::connection::ConnectionInfo;
use crate::relay::RelayServer;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<RelayServer>,
    pub metrics_enabled: bool,
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let accepting = state.server.is_running();
    let health = HealthStatus {
        status: if accepting { "healthy" } else { "stopped" }.to_string(),
        accepting,
    };

    Json(ApiResponse::success(health))
}

/// Get relay status
pub async fn get_server_status(State(state): State<AppState>) -> Json<ApiResponse<ServerStatus>> {
    let server = &state.server;
    let active_connections = server.connection_count();

    let status = ServerStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: server.uptime().as_secs(),
        listen_addr: server.local_addr().map(|addr| addr.to_string()),
        accepting: server.is_running(),
        active_connections,
        counters: server.metrics().snapshot(),
    };

    Json(ApiResponse::success(status))
}

/// Get live connections
pub async fn get_connections(
    State(state): State<AppState>,
    Query(pagination): Query<PaginationQuery>,
) -> Json<ApiResponse<Vec<ConnectionInfo>>> {
    let page = pagination.page.unwrap_or(1).max(1);
    let limit = pagination.limit.unwrap_or(50).clamp(1, 1000);
    let start = (page - 1) * limit;

    let paginated: Vec<ConnectionInfo> = state
        .server
        .connections()
        .into_iter()
        .skip(start)
        .take(limit)
        .collect();

    Json(ApiResponse::success(paginated))
}

/// Prometheus scrape endpoint
pub async fn export_metrics(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.server.metrics().export_prometheus(),
    )
        .into_response()
}

// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked
// via the `AuthBearer` extractor.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::supervisor::Supervisor;

pub fn router(state: Arc<Supervisor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/portfolio", get(portfolio))
        .route("/api/v1/cache", get(cache_snapshot))
        .route("/api/v1/accounts/:id", get(account_view))
        .route("/api/v1/health/ws", get(health_ws))
        .route("/api/v1/health/rest", get(health_rest))
        .route("/api/v1/health/combined", get(health_combined))
        .route("/api/v1/errors", get(errors))
        .route("/api/v1/control/reconnect", post(control_reconnect))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn portfolio(_auth: AuthBearer, State(state): State<Arc<Supervisor>>) -> impl IntoResponse {
    let snapshot = state.cache.snapshot();
    let accounts: Vec<_> = snapshot
        .iter()
        .filter(|(k, _)| k.starts_with("account:"))
        .map(|(_, v)| &v.data)
        .collect();
    let count = accounts.len();
    Json(json!({"accounts": accounts, "count": count}))
}

async fn cache_snapshot(_auth: AuthBearer, State(state): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(state.cache.snapshot())
}

async fn account_view(
    _auth: AuthBearer,
    State(state): State<Arc<Supervisor>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let rest_snapshot = state.cache.get(&format!("account:{id}"));
    let orders = state.cache.get(&format!("ws_orders:{id}"));
    let positions = state.cache.get(&format!("ws_positions:{id}"));
    let trades = state.cache.get(&format!("ws_trades:{id}"));

    let is_live = rest_snapshot
        .as_ref()
        .and_then(|v| v.get("last_update"))
        .and_then(|v| v.as_f64())
        .map(|last_update| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            now - last_update < 10.0
        })
        .unwrap_or(false);

    if rest_snapshot.is_none() && orders.is_none() && positions.is_none() && trades.is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown account"}))).into_response();
    }

    Json(json!({
        "account_id": id,
        "is_live": is_live,
        "rest": rest_snapshot,
        "ws_orders": orders,
        "ws_positions": positions,
        "ws_trades": trades,
    }))
    .into_response()
}

async fn health_ws(_auth: AuthBearer, State(state): State<Arc<Supervisor>>) -> impl IntoResponse {
    let metrics = state.telemetry.metrics();
    Json(json!({
        "connected": metrics.ws_connected,
        "message_count": metrics.ws_message_count,
        "last_message_age_ms": metrics.last_ws_update_age_ms,
        "uptime_secs": metrics.ws_connection_uptime_secs,
        "interval": metrics.ws_messages,
    }))
}

async fn health_rest(_auth: AuthBearer, State(state): State<Arc<Supervisor>>) -> impl IntoResponse {
    let metrics = state.telemetry.metrics();
    Json(json!({
        "request_count": metrics.rest_request_count,
        "last_update_age_ms": metrics.last_rest_update_age_ms,
        "interval": metrics.rest_polling,
    }))
}

async fn health_combined(_auth: AuthBearer, State(state): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(json!({
        "telemetry": state.telemetry.metrics(),
        "connectors": state.health_snapshot(),
        "broadcast_clients": state.hub.count(),
    }))
}

async fn errors(_auth: AuthBearer, State(state): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(json!({
        "summary": state.errors.summary(),
        "recent": state.errors.recent(50, None),
    }))
}

#[derive(Deserialize)]
struct ReconnectQuery {
    account_id: Option<i64>,
}

async fn control_reconnect(
    _auth: AuthBearer,
    State(state): State<Arc<Supervisor>>,
    Query(query): Query<ReconnectQuery>,
) -> impl IntoResponse {
    state.force_reconnect(query.account_id);
    Json(json!({"status": "reconnect triggered", "account_id": query.account_id}))
}

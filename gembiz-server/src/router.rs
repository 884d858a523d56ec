//! Top-level router: public status pages, the chat surface, the admin
//! surface, and panel auth.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::path::PathBuf;

use gembiz_core::proxy::{build_proxy_router, GatewayState};

use crate::api;

pub fn build_router(state: GatewayState, data_dir: PathBuf) -> Router {
    let proxy_router = build_proxy_router(state.clone());
    let admin_router = api::admin_router(state.clone(), data_dir);

    Router::new()
        .route("/", get(root_status))
        .route("/health", get(health))
        .route("/ws", get(ws_stub))
        .with_state(state)
        .nest("/admin", admin_router)
        .merge(proxy_router)
}

async fn root_status(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let stats = state.api_stats.stats();
    let note = state.config.read().note.clone();
    let mut response = json!({
        "status": "running",
        "service": "gembiz",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": "local",
        "flow_enabled": state.flow.is_some(),
        "pool": {
            "ready": state.pool.ready_count(),
            "pending": state.pool.pending_count(),
            "total": state.pool.total_count(),
        },
    });
    if let serde_json::Value::Object(map) = &mut response {
        if let serde_json::Value::Object(stats) = stats {
            map.extend(stats);
        }
        if !note.is_empty() {
            map.insert("note".to_string(), json!(note));
        }
    }
    Json(response)
}

async fn health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
        "ready": state.pool.ready_count(),
        "pending": state.pool.pending_count(),
        "mode": "local",
    }))
}

/// Cluster WebSocket endpoint; only wired when running as pool server,
/// which this deployment does not orchestrate.
async fn ws_stub() -> impl IntoResponse {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "WebSocket service is only available in pool-server mode"})),
    )
}

//! OpenAI-dialect endpoints.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use super::super::pipeline::handle_chat;
use super::super::server::GatewayState;
use gembiz_types::protocol::ChatRequest;

pub async fn list_models(State(state): State<GatewayState>) -> Json<Value> {
    let now = Utc::now().timestamp();
    let models: Vec<Value> = state
        .available_models()
        .into_iter()
        .map(|m| {
            json!({
                "id": m,
                "object": "model",
                "created": now,
                "owned_by": "google",
                "permission": [],
            })
        })
        .collect();
    Json(json!({"object": "list", "data": models}))
}

pub async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut req: ChatRequest = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(e) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    if req.model.is_empty() {
        req.model = state
            .available_models()
            .first()
            .cloned()
            .unwrap_or_else(|| "gemini-2.5-flash".to_string());
    }
    let (ip, ua) = request_meta(&headers);
    handle_chat(state, req, ip, ua).await
}

pub(crate) fn request_meta(headers: &HeaderMap) -> (String, String) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .unwrap_or("unknown")
        .to_string();
    let ua = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (ip, ua)
}

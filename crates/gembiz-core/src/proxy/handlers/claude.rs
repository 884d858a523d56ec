//! Claude Messages endpoint.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use super::super::canonical::claude_to_chat;
use super::super::pipeline::handle_chat;
use super::super::server::GatewayState;
use super::openai::request_meta;
use gembiz_types::protocol::ClaudeRequest;

pub async fn messages(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let claude_req: ClaudeRequest = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "type": "error",
                    "error": {"type": "invalid_request_error", "message": e.to_string()},
                })),
            )
                .into_response();
        }
    };
    let mut req = claude_to_chat(claude_req);
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

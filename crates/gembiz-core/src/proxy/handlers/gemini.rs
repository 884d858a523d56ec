//! Gemini-dialect endpoints.
//!
//! The generate routes match a wildcard because the Gemini path carries the
//! action in the last segment: `{model}:generateContent` or
//! `{model}:streamGenerateContent`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::super::canonical::gemini_to_chat;
use super::super::pipeline::handle_chat;
use super::super::server::GatewayState;
use super::openai::request_meta;
use gembiz_types::protocol::GeminiRequest;

fn model_entry(name: &str) -> Value {
    json!({
        "name": format!("models/{}", name),
        "version": "001",
        "displayName": name,
        "description": format!("Gemini model: {}", name),
        "inputTokenLimit": 1_048_576,
        "outputTokenLimit": 8192,
        "supportedGenerationMethods": ["generateContent", "countTokens"],
        "temperature": 1.0,
        "topP": 0.95,
        "topK": 64,
    })
}

pub async fn list_models(State(state): State<GatewayState>) -> Json<Value> {
    let models: Vec<Value> =
        state.available_models().iter().map(|m| model_entry(m)).collect();
    Json(json!({"models": models}))
}

/// `GET /v1beta/models/{model}` (the wildcard also swallows a stray
/// `models/` prefix).
pub async fn get_model(
    State(state): State<GatewayState>,
    Path(action): Path<String>,
) -> Response {
    let name = action.trim_start_matches('/').trim_start_matches("models/");
    if state.available_models().iter().any(|m| m == name) {
        Json(model_entry(name)).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "code": 404,
                    "message": format!("Model not found: {}", name),
                    "status": "NOT_FOUND",
                }
            })),
        )
            .into_response()
    }
}

/// `POST /v1beta/models/{model}:generateContent` and
/// `:streamGenerateContent` (also `?alt=sse`).
pub async fn generate(
    State(state): State<GatewayState>,
    Path(action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let action = action.trim_start_matches('/');
    let (model, stream) = match action.rsplit_once(':') {
        Some((model, verb)) => (model.to_string(), verb == "streamGenerateContent"),
        None => (action.to_string(), false),
    };
    let model = if model.is_empty() {
        state
            .available_models()
            .first()
            .cloned()
            .unwrap_or_else(|| "gemini-2.5-flash".to_string())
    } else {
        model.trim_start_matches("models/").to_string()
    };
    let stream = stream || query.get("alt").map(String::as_str) == Some("sse");

    let gemini_req: GeminiRequest = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": {"code": 400, "message": e.to_string(), "status": "INVALID_ARGUMENT"}
                })),
            )
                .into_response();
        }
    };

    let req = gemini_to_chat(&gemini_req, &model, stream);
    let (ip, ua) = request_meta(&headers);
    handle_chat(state, req, ip, ua).await
}

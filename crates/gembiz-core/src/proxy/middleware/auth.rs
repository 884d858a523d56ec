//! Request authentication.
//!
//! Chat endpoints accept API keys only; admin endpoints additionally
//! accept a signed panel-session cookie. An empty key list leaves the
//! gateway open (logged at startup).

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::super::server::GatewayState;
use crate::adminauth::SESSION_COOKIE_NAME;

/// Bearer token or `X-API-Key` header value.
pub fn extract_api_key(request: &Request) -> Option<String> {
    let headers = request.headers();
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Panel session token from the cookie header.
pub fn session_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE_NAME && !value.is_empty()).then(|| value.to_string())
    })
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, axum::Json(json!({"error": message}))).into_response()
}

/// Chat-surface auth: API key only.
pub async fn api_key_auth(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let keys = state.api_keys();
    if keys.is_empty() {
        return next.run(request).await;
    }
    match extract_api_key(&request) {
        None => unauthorized("Missing API key"),
        Some(key) if !keys.contains(&key) => unauthorized("Invalid API key"),
        Some(_) => next.run(request).await,
    }
}

/// Admin-surface auth: a valid panel session cookie or a valid API key.
pub async fn admin_auth(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = session_token(request.headers()) {
        if state.sessions.validate(&token).is_some() {
            return next.run(request).await;
        }
    }
    let keys = state.api_keys();
    if !keys.is_empty() {
        if let Some(key) = extract_api_key(&request) {
            if keys.contains(&key) {
                return next.run(request).await;
            }
        }
        return unauthorized("Unauthorized");
    }
    // No keys configured: the admin surface stays reachable, matching the
    // open chat surface.
    next.run(request).await
}

//! Admin panel session auth endpoints.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use gembiz_core::adminauth::SESSION_COOKIE_NAME;
use gembiz_core::proxy::middleware::session_token;
use gembiz_core::proxy::GatewayState;

fn session_cookie(token: &str, max_age_sec: i64) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        SESSION_COOKIE_NAME,
        token,
        max_age_sec.max(0)
    )
}

fn clear_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax", SESSION_COOKIE_NAME)
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub async fn login(
    State(state): State<GatewayState>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let username = req.username.trim();
    let password = req.password.trim();
    if username.is_empty() || password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "username and password are required"})),
        )
            .into_response();
    }
    if !state.admin_store.verify(username, password) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid username or password"})),
        )
            .into_response();
    }

    let session = state.sessions.create(username);
    let max_age = (session.expires_at - Utc::now()).num_seconds();
    (
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie(&session.token, max_age))],
        Json(json!({
            "success": true,
            "username": session.username,
            "expires_at": session.expires_at,
        })),
    )
        .into_response()
}

pub async fn logout(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.sessions.delete(&token);
    }
    (
        StatusCode::OK,
        [(header::SET_COOKIE, clear_cookie())],
        Json(json!({"success": true})),
    )
        .into_response()
}

pub async fn me(State(state): State<GatewayState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let Some(info) = session_token(&headers).and_then(|t| state.sessions.validate(&t)) else {
        return Json(json!({"authenticated": false}));
    };
    Json(json!({
        "authenticated": true,
        "username": info.username,
        "expires_at": info.expires_at,
    }))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub new_password: String,
}

/// Only a logged-in panel session may change the password; API keys are
/// deliberately not enough.
pub async fn change_password(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Response {
    let Some(_session) = session_token(&headers).and_then(|t| state.sessions.validate(&t)) else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "only a panel session may change the password"})),
        )
            .into_response();
    };

    match state.admin_store.change_password(&req.new_password) {
        Ok(updated_at) => {
            let username = state.admin_store.username();
            state.sessions.delete_by_username(&username);
            (
                StatusCode::OK,
                [(header::SET_COOKIE, clear_cookie())],
                Json(json!({
                    "success": true,
                    "username": username,
                    "password_updated_at": updated_at,
                })),
            )
                .into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response(),
    }
}

//! Pool and telemetry admin handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use gembiz_core::collab::BrowserAutomation;
use gembiz_core::pool::PoolSettings;
use gembiz_types::models::AccountStatus;

use super::AdminContext;

/// `a***b@domain` masking for account listings.
pub fn mask_email(email: &str) -> String {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        if email.chars().count() <= 3 {
            return "***".to_string();
        }
        let chars: Vec<char> = email.chars().collect();
        return format!("{}***{}", chars[0], chars[chars.len() - 1]);
    };
    let chars: Vec<char> = local.chars().collect();
    let masked = if chars.len() <= 2 {
        format!("{}***", chars.first().map(ToString::to_string).unwrap_or_default())
    } else {
        format!("{}***{}", chars[0], chars[chars.len() - 1])
    };
    format!("{}@{}", masked, domain)
}

pub async fn status(State(ctx): State<AdminContext>) -> Json<Value> {
    let config = ctx.state.config.read().clone();
    let mut stats = ctx.state.pool.stats();
    if let Value::Object(map) = &mut stats {
        map.insert("target".to_string(), json!(config.pool.target_count));
        map.insert("min".to_string(), json!(config.pool.min_count));
        map.insert("mode".to_string(), json!("local"));
        map.insert(
            "external_refresh_mode".to_string(),
            json!(config.pool.external_refresh_mode),
        );
    }
    Json(stats)
}

pub async fn stats(State(ctx): State<AdminContext>) -> Json<Value> {
    let mut detailed = ctx.state.api_stats.detailed_stats();
    if let Value::Object(map) = &mut detailed {
        map.insert("pool".to_string(), ctx.state.pool.stats());
    }
    Json(detailed)
}

pub async fn ip_stats(State(ctx): State<AdminContext>) -> Json<Value> {
    Json(ctx.state.ip_stats.all())
}

pub async fn refresh(State(ctx): State<AdminContext>) -> impl IntoResponse {
    match ctx.state.pool.load(&ctx.data_dir) {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "message": "reload complete",
                "ready": ctx.state.pool.ready_count(),
                "pending": ctx.state.pool.pending_count(),
            })),
        ),
        Err(e) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
        }
    }
}

pub async fn force_refresh(State(ctx): State<AdminContext>) -> Json<Value> {
    let count = ctx.state.pool.force_refresh_all();
    Json(json!({"message": "forced refresh triggered", "count": count}))
}

#[derive(Deserialize, Default)]
pub struct RegisterRequest {
    #[serde(default)]
    pub count: usize,
}

pub async fn register(
    State(ctx): State<AdminContext>,
    body: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let config = ctx.state.config.read().clone();
    if !config.pool.enable_go_register {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "built-in registration disabled; use the external registrar"})),
        );
    }
    let mut count = body.map(|Json(b)| b.count).unwrap_or(0);
    if count == 0 {
        count = config.pool.target_count.saturating_sub(ctx.state.pool.total_count());
    }
    if count == 0 {
        return (
            StatusCode::OK,
            Json(json!({"message": "pool already at target", "count": ctx.state.pool.total_count()})),
        );
    }
    let browser = ctx.state.browser.clone();
    let headless = config.pool.register_headless;
    tokio::spawn(async move {
        match browser.register_accounts(count, headless).await {
            Ok(done) => tracing::info!("Registration finished: {} account(s)", done),
            Err(e) => tracing::error!("Registration failed: {}", e),
        }
    });
    (StatusCode::OK, Json(json!({"message": "registration started", "target": count})))
}

pub async fn reload_config(State(ctx): State<AdminContext>) -> impl IntoResponse {
    let path = std::path::Path::new(gembiz_core::config::CONFIG_PATH);
    if let Err(e) = gembiz_core::config::reload(path, &ctx.state.config, &ctx.state.pool) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e})));
    }
    let config = ctx.state.config.read().clone();
    (
        StatusCode::OK,
        Json(json!({
            "message": "config reloaded",
            "api_keys": config.api_keys.len(),
            "debug": config.debug,
            "pool_config": {
                "refresh_cooldown_sec": config.pool.refresh_cooldown_sec,
                "use_cooldown_sec": config.pool.use_cooldown_sec,
                "max_fail_count": config.pool.max_fail_count,
                "enable_browser_refresh": config.pool.enable_browser_refresh,
                "browser_refresh_headless": config.pool.browser_refresh_headless,
                "browser_refresh_max_retry": config.pool.browser_refresh_max_retry,
                "auto_delete_401": config.pool.auto_delete_401,
                "registrar_base_url": config.pool.registrar_base_url,
            },
        })),
    )
}

#[derive(Deserialize)]
pub struct CooldownRequest {
    #[serde(default)]
    pub refresh_cooldown_sec: u64,
    #[serde(default)]
    pub use_cooldown_sec: u64,
}

pub async fn config_cooldown(
    State(ctx): State<AdminContext>,
    Json(req): Json<CooldownRequest>,
) -> Json<Value> {
    ctx.state.pool.set_cooldowns(req.refresh_cooldown_sec, req.use_cooldown_sec);
    {
        let mut config = ctx.state.config.write();
        if req.refresh_cooldown_sec > 0 {
            config.pool.refresh_cooldown_sec = req.refresh_cooldown_sec;
        }
        if req.use_cooldown_sec > 0 {
            config.pool.use_cooldown_sec = req.use_cooldown_sec;
        }
    }
    let settings = ctx.state.pool.settings();
    Json(json!({
        "message": "cooldowns updated",
        "refresh_cooldown_sec": settings.refresh_cooldown_sec,
        "use_cooldown_sec": settings.use_cooldown_sec,
    }))
}

#[derive(Deserialize)]
pub struct BrowserRefreshConfigRequest {
    pub enable: Option<bool>,
    pub headless: Option<bool>,
}

pub async fn config_browser_refresh(
    State(ctx): State<AdminContext>,
    Json(req): Json<BrowserRefreshConfigRequest>,
) -> Json<Value> {
    let settings = {
        let mut config = ctx.state.config.write();
        if let Some(enable) = req.enable {
            config.pool.enable_browser_refresh = enable;
        }
        if let Some(headless) = req.headless {
            config.pool.browser_refresh_headless = headless;
        }
        PoolSettings::from_config(&config)
    };
    ctx.state.pool.update_settings(settings.clone());
    Json(json!({
        "message": "browser refresh config updated",
        "enable": settings.enable_browser_refresh,
        "headless": settings.browser_refresh_headless,
    }))
}

#[derive(Deserialize)]
pub struct BrowserRefreshRequest {
    pub email: String,
}

/// Manually run the browser collaborator against one account.
pub async fn browser_refresh(
    State(ctx): State<AdminContext>,
    Json(req): Json<BrowserRefreshRequest>,
) -> impl IntoResponse {
    if req.email.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "email is required"})));
    }
    let Some(data) = ctx.state.pool.account_data(&req.email) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "account not found", "email": req.email})),
        );
    };
    let state = ctx.state.clone();
    let email = data.email.clone();
    tokio::spawn(async move {
        tracing::info!("Manual browser refresh: {}", email);
        let headless = state.pool.settings().browser_refresh_headless;
        match state.browser.refresh_credentials(&data, headless).await {
            Ok(result) => {
                state.pool.update_credentials(&email, result.into());
                if let Err(e) = state.pool.save_account(&email).await {
                    tracing::error!("[{}] failed to save refreshed data: {}", email, e);
                }
                state.pool.mark_needs_refresh(&email);
                tracing::info!("Manual browser refresh succeeded: {}", email);
            }
            Err(e) => tracing::error!("Manual browser refresh failed: {} - {}", email, e),
        }
    });
    (StatusCode::OK, Json(json!({"message": "browser refresh triggered", "email": req.email})))
}

#[derive(Deserialize, Default)]
pub struct AccountsQuery {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub q: String,
}

fn normalize_state_filter(raw: &str) -> &str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "active" => "active",
        "invalid" => "invalid",
        _ => "all",
    }
}

fn matches_state(status: AccountStatus, state: &str) -> bool {
    match state {
        "active" => status.is_active(),
        "invalid" => !status.is_active(),
        _ => true,
    }
}

pub async fn accounts(
    State(ctx): State<AdminContext>,
    Query(query): Query<AccountsQuery>,
) -> Json<Value> {
    let state_filter = normalize_state_filter(&query.state);
    let status_filter: Vec<AccountStatus> =
        query.status.split(',').filter_map(AccountStatus::normalize).collect();
    let q = query.q.trim().to_ascii_lowercase();

    let items: Vec<Value> = ctx
        .state
        .pool
        .list_accounts()
        .into_iter()
        .filter(|info| matches_state(info.status, state_filter))
        .filter(|info| status_filter.is_empty() || status_filter.contains(&info.status))
        .filter(|info| q.is_empty() || info.email.to_ascii_lowercase().contains(&q))
        .map(|info| {
            let mut row = serde_json::to_value(&info).unwrap_or_else(|_| json!({}));
            if let Value::Object(map) = &mut row {
                map.insert("email_masked".to_string(), json!(mask_email(&info.email)));
                map.insert(
                    "is_valid".to_string(),
                    json!(info.status.is_active() && info.invalid_reason.is_empty()),
                );
                map.remove("email");
            }
            row
        })
        .collect();

    Json(json!({
        "items": items,
        "total": items.len(),
        "state": state_filter,
        "status": query.status,
        "q": query.q,
    }))
}

#[derive(Deserialize, Default)]
pub struct LogsQuery {
    #[serde(default)]
    pub replay: Option<usize>,
}

/// SSE log fan-out: a bounded replay of recent lines, then live events.
pub async fn logs_stream(
    State(ctx): State<AdminContext>,
    Query(query): Query<LogsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let replay = ctx.state.logs.recent(query.replay.unwrap_or(100));
    let rx = ctx.state.logs.subscribe();

    let replay_stream = futures::stream::iter(replay)
        .map(|line| Ok(Event::default().data(serde_json::to_string(&line).unwrap_or_default())));
    let live_stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|item| futures::future::ready(item.ok()))
        .map(|line| Ok(Event::default().data(serde_json::to_string(&line).unwrap_or_default())));

    Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_masking() {
        assert_eq!(mask_email("alice@example.com"), "a***e@example.com");
        assert_eq!(mask_email("ab@example.com"), "a***@example.com");
        assert_eq!(mask_email("xy"), "***");
        assert_eq!(mask_email("nodomain"), "n***n");
    }

    #[test]
    fn state_filters() {
        assert_eq!(normalize_state_filter(""), "all");
        assert_eq!(normalize_state_filter("Active"), "active");
        assert_eq!(normalize_state_filter("bogus"), "all");
        assert!(matches_state(AccountStatus::Ready, "active"));
        assert!(!matches_state(AccountStatus::Invalid, "active"));
        assert!(matches_state(AccountStatus::Invalid, "invalid"));
        assert!(matches_state(AccountStatus::Pending, "all"));
    }
}

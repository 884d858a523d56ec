//! Admin and panel-auth routers.

mod admin;
mod panel;
mod pool_files;
mod registrar;

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;

use gembiz_core::proxy::middleware::admin_auth;
use gembiz_core::proxy::GatewayState;

/// Data-dir handle shared by the pool-file maintenance handlers.
#[derive(Clone)]
pub struct AdminContext {
    pub state: GatewayState,
    pub data_dir: PathBuf,
}

/// `/admin/*`: API key or panel session required, except the panel auth
/// endpoints, which are merged in without the middleware.
pub fn admin_router(state: GatewayState, data_dir: PathBuf) -> Router {
    let ctx = AdminContext { state: state.clone(), data_dir };
    let protected = Router::new()
        .route("/status", get(admin::status))
        .route("/stats", get(admin::stats))
        .route("/ip", get(admin::ip_stats))
        .route("/refresh", post(admin::refresh))
        .route("/force-refresh", post(admin::force_refresh))
        .route("/register", post(admin::register))
        .route("/reload-config", post(admin::reload_config))
        .route("/config/cooldown", post(admin::config_cooldown))
        .route("/config/browser-refresh", post(admin::config_browser_refresh))
        .route("/browser-refresh", post(admin::browser_refresh))
        .route("/accounts", get(admin::accounts))
        .route("/logs/stream", get(admin::logs_stream))
        .route("/pool-files", get(pool_files::list))
        .route("/pool-files/export", get(pool_files::export))
        .route("/pool-files/import", post(pool_files::import))
        .route("/pool-files/delete-invalid/preview", post(pool_files::delete_invalid_preview))
        .route("/pool-files/delete-invalid/execute", post(pool_files::delete_invalid_execute))
        .route("/registrar/upload-account", post(registrar::upload_account))
        .route("/registrar/refresh-tasks", get(registrar::refresh_tasks))
        .route("/registrar/refresh-tasks/claim", post(registrar::claim_refresh_tasks))
        .route("/registrar/refresh-tasks/fail", post(registrar::fail_refresh_task))
        .route("/registrar/metrics", get(registrar::metrics))
        .route("/registrar/trigger-register", post(registrar::trigger_register))
        .layer(axum::middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(ctx);

    // Panel session endpoints: login must stay reachable without a session;
    // change-password checks the session inside the handler.
    let panel = Router::new()
        .route("/panel/login", post(panel::login))
        .route("/panel/logout", post(panel::logout))
        .route("/panel/me", get(panel::me))
        .route("/panel/change-password", post(panel::change_password))
        .with_state(state);

    protected.merge(panel)
}

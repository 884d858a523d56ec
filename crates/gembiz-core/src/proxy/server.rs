//! Shared application state and the chat-surface router.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::adminauth::{CredentialStore, SessionManager};
use crate::collab::{BrowserAutomation, MediaGenerator};
use crate::config::SharedConfig;
use crate::logstream::LogBuffer;
use crate::pool::AccountPool;
use crate::stats::{ApiStats, IpStats, RequestSample};
use crate::upstream::UpstreamClient;

use super::handlers;
use super::middleware::api_key_auth;

/// Everything the handlers need, cloned per request.
#[derive(Clone)]
pub struct GatewayState {
    pub pool: Arc<AccountPool>,
    pub upstream: Arc<UpstreamClient>,
    pub config: SharedConfig,
    pub api_stats: Arc<ApiStats>,
    pub ip_stats: Arc<IpStats>,
    /// Client for user-supplied media URLs; separate from the upstream
    /// client so its proxy/timeout policy can differ.
    pub media_client: reqwest::Client,
    pub flow: Option<Arc<dyn MediaGenerator>>,
    pub browser: Arc<dyn BrowserAutomation>,
    pub admin_store: Arc<CredentialStore>,
    pub sessions: Arc<SessionManager>,
    pub logs: Arc<LogBuffer>,
    pub start_time: DateTime<Utc>,
}

impl GatewayState {
    pub fn api_keys(&self) -> Vec<String> {
        self.config.read().api_keys.clone()
    }

    /// The user-facing model catalog, Flow models included when that
    /// collaborator is present.
    pub fn available_models(&self) -> Vec<String> {
        let mut models = super::models::available_models();
        if let Some(flow) = &self.flow {
            models.extend(flow.models());
        }
        models
    }

    /// Single per-request stats hook: updates the global, per-model, and
    /// per-IP aggregators exactly once.
    pub fn record_request(&self, client_ip: &str, user_agent: &str, sample: &RequestSample) {
        self.api_stats.record(sample);
        self.ip_stats.record(client_ip, user_agent, sample);
    }
}

/// Chat-surface router: the three dialects plus model catalogs, all behind
/// API-key auth.
pub fn build_proxy_router(state: GatewayState) -> Router<()> {
    Router::new()
        // OpenAI protocol
        .route("/v1/models", get(handlers::openai::list_models))
        .route("/v1/chat/completions", post(handlers::openai::chat_completions))
        // Claude protocol
        .route("/v1/messages", post(handlers::claude::messages))
        // Gemini protocol; the wildcard carries "{model}:generateContent"
        .route("/v1beta/models", get(handlers::gemini::list_models))
        .route(
            "/v1beta/models/*action",
            get(handlers::gemini::get_model).post(handlers::gemini::generate),
        )
        .route("/v1/models/*action", post(handlers::gemini::generate))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(state.clone(), api_key_auth))
        .with_state(state)
}

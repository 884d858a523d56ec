//! End-to-end pipeline behavior against a mocked upstream.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use gembiz_core::adminauth::{CredentialStore, SessionManager};
use gembiz_core::collab::NoBrowser;
use gembiz_core::logstream::LogBuffer;
use gembiz_core::pool::{AccountPool, PoolSettings};
use gembiz_core::proxy::pipeline::handle_chat;
use gembiz_core::proxy::{build_proxy_router, GatewayState};
use gembiz_core::stats::{ApiStats, IpStats};
use gembiz_core::upstream::UpstreamClient;
use gembiz_types::models::{AccountData, AccountStatus, Cookie};
use gembiz_types::protocol::{ChatRequest, Message};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    state: GatewayState,
    _data_dir: tempfile::TempDir,
}

fn account_file(dir: &std::path::Path, email: &str, csesidx: &str) {
    let data = AccountData {
        email: email.to_string(),
        authorization: "Bearer original-auth".to_string(),
        cookies: vec![Cookie::new("__Secure-C_SES", "ses", ".gemini.google")],
        config_id: "cfg-1".to_string(),
        csesidx: csesidx.to_string(),
        ..AccountData::default()
    };
    std::fs::write(
        dir.join(format!("{}.json", email)),
        serde_json::to_string(&data).unwrap(),
    )
    .unwrap();
}

/// Pool with the given accounts promoted to ready, pointed at the mock
/// upstream.
async fn harness(server: &MockServer, accounts: &[(&str, &str)]) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    for (email, csesidx) in accounts {
        account_file(data_dir.path(), email, csesidx);
    }
    let pool = Arc::new(AccountPool::new(PoolSettings {
        use_cooldown_sec: 0,
        refresh_cooldown_sec: 0,
        ..PoolSettings::default()
    }));
    pool.load(data_dir.path()).unwrap();
    for (email, _) in accounts {
        // Stale expiry forces a mint through the mock XSRF endpoint.
        pool.promote_ready(email, String::new(), chrono::Utc::now());
    }

    let config = gembiz_core::config::shared(gembiz_types::models::AppConfig::default());
    let state = GatewayState {
        pool,
        upstream: Arc::new(
            UpstreamClient::new(None).with_base_urls(server.uri(), server.uri()),
        ),
        config,
        api_stats: Arc::new(ApiStats::new()),
        ip_stats: Arc::new(IpStats::new()),
        media_client: reqwest::Client::new(),
        flow: None,
        browser: Arc::new(NoBrowser),
        admin_store: Arc::new(CredentialStore::new(data_dir.path()).unwrap()),
        sessions: Arc::new(SessionManager::new()),
        logs: Arc::new(LogBuffer::new()),
        start_time: chrono::Utc::now(),
    };
    Harness { state, _data_dir: data_dir }
}

fn mint_mock(csesidx: &str, jwt: &str) -> Mock {
    Mock::given(method("GET"))
        .and(path("/api/getoxsrf"))
        .and(query_param("csesidx", csesidx))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            ")]}}'\n{{\"xsrfToken\":\"{}\",\"keyId\":\"kid\"}}",
            jwt
        )))
}

fn session_mock() -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetCreateSession"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"session": {"name": "sessions/s-1"}})),
        )
}

fn assist_events(text: &str) -> Value {
    json!([{
        "streamAssistResponse": {
            "sessionInfo": {"session": "projects/1/sessions/s-1"},
            "answer": {"replies": [
                {"groundedContent": {"content": {"text": text}}}
            ]}
        }
    }])
}

fn user_request(model: &str, text: &str, stream: bool) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![Message::text("user", text)],
        stream,
        ..ChatRequest::default()
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn simple_chat_with_one_ready_account() {
    let server = MockServer::start().await;
    mint_mock("1", "jwt-a").mount(&server).await;
    session_mock().mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assist_events("Hello there")))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, &[("solo@example.com", "1")]).await;
    let response = handle_chat(
        h.state.clone(),
        user_request("gemini-2.5-flash", "hi", false),
        "9.9.9.9".to_string(),
        "test-agent".to_string(),
    )
    .await;

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["object"], "chat.completion");

    let info = &h.state.pool.list_accounts()[0];
    assert_eq!(info.total_count, 1);
    assert_eq!(info.success_count, 1);

    let stats = h.state.api_stats.stats();
    assert_eq!(stats["total_requests"], 1);
    assert_eq!(stats["success_requests"], 1);
}

#[tokio::test]
async fn auth_failure_rotates_to_the_next_account() {
    let server = MockServer::start().await;
    mint_mock("1", "jwt-a").mount(&server).await;
    mint_mock("2", "jwt-b").mount(&server).await;
    session_mock().mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .and(header("authorization", "Bearer jwt-a"))
        .respond_with(ResponseTemplate::new(401).set_body_string("UNAUTHENTICATED"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .and(header("authorization", "Bearer jwt-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assist_events("from B")))
        .mount(&server)
        .await;

    let h = harness(&server, &[("a@example.com", "1"), ("b@example.com", "2")]).await;
    let response = handle_chat(
        h.state.clone(),
        user_request("gemini-2.5-flash", "hi", false),
        "ip".to_string(),
        String::new(),
    )
    .await;

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "from B");

    let accounts = h.state.pool.list_accounts();
    let a = accounts.iter().find(|i| i.email == "a@example.com").unwrap();
    let b = accounts.iter().find(|i| i.email == "b@example.com").unwrap();
    // Auth errors park the account without charging its failure streak.
    assert_eq!(a.status, AccountStatus::Pending);
    assert_eq!(a.fail_count, 0);
    assert_eq!(b.status, AccountStatus::Ready);
    assert_eq!(b.success_count, 1);
}

#[tokio::test]
async fn streaming_emits_role_content_finish_and_done() {
    let server = MockServer::start().await;
    mint_mock("1", "jwt-a").mount(&server).await;
    session_mock().mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assist_events("streamed text")))
        .mount(&server)
        .await;

    let h = harness(&server, &[("solo@example.com", "1")]).await;
    let response = handle_chat(
        h.state.clone(),
        user_request("gemini-2.5-flash", "hi", true),
        "ip".to_string(),
        String::new(),
    )
    .await;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| f.strip_prefix("data: ").unwrap_or(f))
        .collect();
    assert_eq!(*frames.last().unwrap(), "[DONE]");

    let chunks: Vec<Value> = frames
        .iter()
        .filter(|f| **f != "[DONE]")
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    let role_frames: Vec<&Value> = chunks
        .iter()
        .filter(|c| c["choices"][0]["delta"]["role"] == "assistant")
        .collect();
    assert_eq!(role_frames.len(), 1, "exactly one role frame");
    assert!(chunks
        .iter()
        .any(|c| c["choices"][0]["delta"]["content"] == "streamed text"));
    assert_eq!(
        chunks.last().unwrap()["choices"][0]["finish_reason"],
        "stop"
    );
}

#[tokio::test]
async fn truncated_event_array_is_recovered_without_a_retry() {
    let server = MockServer::start().await;
    mint_mock("1", "jwt-a").mount(&server).await;
    session_mock().mount(&server).await;

    let full = json!([
        {"streamAssistResponse": {"answer": {"replies": [
            {"groundedContent": {"content": {"text": "part one "}}}]}}},
        {"streamAssistResponse": {"answer": {"replies": [
            {"groundedContent": {"content": {"text": "part two"}}}]}}},
        {"streamAssistResponse": {"answer": {"replies": [
            {"groundedContent": {"content": {"text": "part three (lost)"}}}]}}}
    ]);
    let mut body = serde_json::to_vec(&full).unwrap();
    body.truncate(body.len() - 40);

    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, &[("solo@example.com", "1")]).await;
    let response = handle_chat(
        h.state.clone(),
        user_request("gemini-2.5-flash", "hi", false),
        "ip".to_string(),
        String::new(),
    )
    .await;

    assert_eq!(response.status(), 200);
    let value = body_json(response).await;
    assert_eq!(value["choices"][0]["message"]["content"], "part one part two");
}

#[tokio::test]
async fn user_media_url_auth_failure_surfaces_without_rotation() {
    let server = MockServer::start().await;
    mint_mock("1", "jwt-a").mount(&server).await;
    session_mock().mount(&server).await;
    // Upload-by-URL is rejected so the pipeline falls back to downloading
    // the user's URL, which answers 401.
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetAddContextFile"))
        .respond_with(ResponseTemplate::new(400).set_body_string("no remote fetch"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/image.png"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let h = harness(&server, &[("solo@example.com", "1")]).await;
    let req = ChatRequest {
        model: "gemini-2.5-flash".to_string(),
        messages: vec![Message {
            role: "user".to_string(),
            content: json!([
                {"type": "text", "text": "describe"},
                {"type": "image_url", "image_url": {"url": format!("{}/private/image.png", server.uri())}}
            ]),
            ..Message::default()
        }],
        ..ChatRequest::default()
    };
    let response =
        handle_chat(h.state.clone(), req, "ip".to_string(), String::new()).await;

    assert_eq!(response.status(), 500);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "media_download_failed");
    // The URL was the user's problem; the account keeps its slot.
    assert_eq!(h.state.pool.list_accounts()[0].status, AccountStatus::Ready);
}

#[tokio::test]
async fn rate_limit_extends_cooldown_and_does_not_consume_an_attempt() {
    let server = MockServer::start().await;
    mint_mock("1", "jwt-a").mount(&server).await;
    mint_mock("2", "jwt-b").mount(&server).await;
    session_mock().mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .and(header("authorization", "Bearer jwt-a"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1alpha/locations/global/widgetStreamAssist"))
        .and(header("authorization", "Bearer jwt-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assist_events("ok")))
        .mount(&server)
        .await;

    let h = harness(&server, &[("a@example.com", "1"), ("b@example.com", "2")]).await;
    // Give the rate-limited account a real cooldown window to observe.
    let mut settings = h.state.pool.settings();
    settings.use_cooldown_sec = 60;
    h.state.pool.update_settings(settings);

    let response = handle_chat(
        h.state.clone(),
        user_request("gemini-2.5-flash", "hi", false),
        "ip".to_string(),
        String::new(),
    )
    .await;
    assert_eq!(response.status(), 200);

    let accounts = h.state.pool.list_accounts();
    let a = accounts.iter().find(|i| i.email == "a@example.com").unwrap();
    assert_eq!(a.status, AccountStatus::Ready, "429 parks via cooldown, not refresh");
    assert_eq!(a.fail_count, 1);

    // With the base cooldown lifted, only the rate-limited account's
    // extended window keeps it out of selection.
    let mut settings = h.state.pool.settings();
    settings.use_cooldown_sec = 0;
    h.state.pool.update_settings(settings);
    let picked = h.state.pool.next().expect("the healthy account must stay selectable");
    assert_eq!(picked.email, "b@example.com");
}

#[tokio::test]
async fn api_keys_apply_hot_without_a_restart() {
    let server = MockServer::start().await;
    let h = harness(&server, &[]).await;
    h.state.config.write().api_keys = vec!["key-one".to_string()];

    let app = build_proxy_router(h.state.clone());
    let request = |key: &str| {
        axum::http::Request::builder()
            .uri("/v1/models")
            .header("authorization", format!("Bearer {}", key))
            .body(axum::body::Body::empty())
            .unwrap()
    };

    let ok = app.clone().oneshot(request("key-one")).await.unwrap();
    assert_eq!(ok.status(), 200);

    let denied = app.clone().oneshot(request("key-two")).await.unwrap();
    assert_eq!(denied.status(), 401);

    h.state.config.write().api_keys = vec!["key-two".to_string()];
    let now_ok = app.clone().oneshot(request("key-two")).await.unwrap();
    assert_eq!(now_ok.status(), 200);
    let now_denied = app.oneshot(request("key-one")).await.unwrap();
    assert_eq!(now_denied.status(), 401);
}

#[tokio::test]
async fn model_catalogs_expose_the_suffix_cross_product() {
    let server = MockServer::start().await;
    let h = harness(&server, &[]).await;
    let app = build_proxy_router(h.state.clone());

    let response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/models")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    let ids: Vec<&str> =
        body["data"].as_array().unwrap().iter().filter_map(|m| m["id"].as_str()).collect();
    assert!(ids.contains(&"gemini-2.5-flash"));
    assert!(ids.contains(&"gemini-2.5-pro-image"));
    assert!(ids.contains(&"gemini-3-flash-search"));
    assert!(!ids.iter().any(|id| id.starts_with("veo_")), "flow models need the collaborator");

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1beta/models/gemini-2.5-flash")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["name"], "models/gemini-2.5-flash");
}

#[tokio::test]
async fn no_available_account_yields_a_json_500() {
    let server = MockServer::start().await;
    let h = harness(&server, &[]).await;
    let response = handle_chat(
        h.state.clone(),
        user_request("gemini-2.5-flash", "hi", false),
        "ip".to_string(),
        String::new(),
    )
    .await;
    assert_eq!(response.status(), 500);
    let body = body_json(response).await;
    assert_eq!(body["error"], "no account available");
}

#[tokio::test]
async fn flow_models_fail_clearly_without_the_collaborator() {
    let server = MockServer::start().await;
    let h = harness(&server, &[("solo@example.com", "1")]).await;
    let response = handle_chat(
        h.state.clone(),
        user_request("veo_2_0_t2v_portrait", "a sunrise", false),
        "ip".to_string(),
        String::new(),
    )
    .await;
    assert_eq!(response.status(), 503);
}

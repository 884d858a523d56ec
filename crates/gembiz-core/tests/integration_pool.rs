//! Pool behavior: loading, selection, the external-refresh lease protocol,
//! and the upload → refresh-worker → ready cycle.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use gembiz_core::collab::NoBrowser;
use gembiz_core::pool::{
    process_account_upload, AccountPool, AccountUploadRequest, PoolSettings,
};
use gembiz_core::refresh::{RefreshEngine, RefreshOutcome};
use gembiz_core::upstream::UpstreamClient;
use gembiz_types::error::PoolError;
use gembiz_types::models::{AccountData, AccountStatus, Cookie};
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_settings() -> PoolSettings {
    PoolSettings {
        use_cooldown_sec: 0,
        refresh_cooldown_sec: 0,
        max_fail_count: 3,
        daily_limit: 100,
        auto_delete_401: false,
        external_refresh_mode: false,
        enable_browser_refresh: false,
        browser_refresh_headless: true,
        browser_refresh_max_retry: 0,
        default_config: String::new(),
    }
}

fn account_data(email: &str, csesidx: &str) -> AccountData {
    AccountData {
        email: email.to_string(),
        full_name: "Tester".to_string(),
        mail_provider: "chatgpt".to_string(),
        authorization: "Bearer old-auth".to_string(),
        cookies: vec![Cookie::new("__Secure-C_SES", "cookie", ".gemini.google")],
        config_id: "cfg-old".to_string(),
        csesidx: csesidx.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        ..AccountData::default()
    }
}

fn write_account(dir: &Path, email: &str, csesidx: &str) {
    let raw = serde_json::to_string_pretty(&account_data(email, csesidx)).unwrap();
    std::fs::write(dir.join(format!("{}.json", email)), raw).unwrap();
}

/// Park one loaded account as pending-external the way production does:
/// promote it, flip external mode, then flag it for refresh.
fn park_external(pool: &AccountPool, email: &str) {
    let mut settings = pool.settings();
    settings.external_refresh_mode = true;
    pool.update_settings(settings);
    pool.promote_ready(email, "stale-jwt".to_string(), chrono::Utc::now());
    pool.mark_needs_refresh(email);
}

#[tokio::test]
async fn upload_without_credentials_is_rejected_as_client_error() {
    let dir = tempfile::tempdir().unwrap();
    let pool = AccountPool::new(test_settings());
    let req = AccountUploadRequest { email: "demo@example.com".to_string(), ..Default::default() };

    let err = process_account_upload(&pool, dir.path(), &req).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidUpload { .. }));
    assert_eq!(err.http_status_code(), 400);
}

#[test]
fn load_skips_known_sibling_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("admin_panel_auth.json"),
        r#"{"version":1,"username":"admin","password_hash":"x"}"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("invalid-backup-20260101.zip"), b"zip").unwrap();
    std::fs::write(dir.path().join("pool-export-1.json"), b"{}").unwrap();
    write_account(dir.path(), "valid@example.com", "101");

    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    assert_eq!(pool.pending_count(), 1);
    assert_eq!(pool.total_count(), 1);
    assert_eq!(pool.account_data("valid@example.com").unwrap().csesidx, "101");
}

#[test]
fn load_is_idempotent_and_rejects_mismatched_filenames() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "one@example.com", "1");
    // Record whose email disagrees with its file name.
    let raw = serde_json::to_string(&account_data("other@example.com", "2")).unwrap();
    std::fs::write(dir.path().join("mismatch@example.com.json"), raw).unwrap();

    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    pool.load(dir.path()).unwrap();

    assert_eq!(pool.pending_count(), 1);
    assert_eq!(pool.total_count(), 1);
    let invalid: Vec<_> = pool
        .list_accounts()
        .into_iter()
        .filter(|info| info.status == AccountStatus::Invalid)
        .collect();
    assert_eq!(invalid.len(), 1);
    assert!(invalid[0].invalid_reason.contains("does not match"));
}

#[test]
fn external_tasks_are_listed_but_skipped_by_the_internal_worker() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "external@example.com", "100");
    write_account(dir.path(), "normal@example.com", "200");

    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    park_external(&pool, "external@example.com");

    let tasks = pool.external_refresh_tasks(10);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].email, "external@example.com");
    assert!(tasks[0].task_id.is_empty(), "list-only view must not lease");

    let next = pool.get_pending_account().expect("normal pending account");
    assert_eq!(next.email, "normal@example.com");
    assert!(pool.get_pending_account().is_none(), "external account must stay parked");
    assert_eq!(pool.pending_count(), 1);
}

#[test]
fn concurrent_claims_hand_the_task_to_exactly_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "exclusive@example.com", "1001");
    let pool = Arc::new(AccountPool::new(test_settings()));
    pool.load(dir.path()).unwrap();
    park_external(&pool, "exclusive@example.com");

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let handles: Vec<_> = ["worker-a", "worker-b"]
        .into_iter()
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                pool.claim_external_refresh_tasks(worker, 1, 120)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let total: usize = results.iter().map(Vec::len).sum();
    assert_eq!(total, 1, "exactly one worker may win the claim");
    assert!(pool.claim_external_refresh_tasks("worker-c", 1, 120).is_empty());
}

#[tokio::test]
async fn expired_leases_are_reclaimed_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "expired@example.com", "1");
    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    park_external(&pool, "expired@example.com");

    let first = pool.claim_external_refresh_tasks("old-worker", 1, 1);
    assert_eq!(first.len(), 1);
    let first_task = first[0].task_id.clone();
    assert!(!first_task.is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    let second = pool.claim_external_refresh_tasks("new-worker", 1, 120);
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].task_id, first_task, "reclaim must issue a fresh task id");

    let metrics = pool.collect_external_refresh_metrics();
    assert_eq!(metrics["refresh_lease_expired_total"], 1);
}

#[test]
fn failed_tasks_back_off_before_the_next_claim() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "backoff@example.com", "1");
    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    park_external(&pool, "backoff@example.com");

    let tasks = pool.claim_external_refresh_tasks("worker", 1, 120);
    assert_eq!(tasks.len(), 1);
    let task_id = tasks[0].task_id.clone();

    // Wrong worker id must not clear someone else's lease.
    let err = pool.mark_external_refresh_failed(&task_id, "imposter", "nope").unwrap_err();
    assert!(matches!(err, PoolError::LeaseMismatch { .. }));

    pool.mark_external_refresh_failed(&task_id, "worker", "browser crashed").unwrap();
    assert!(
        pool.claim_external_refresh_tasks("worker", 1, 120).is_empty(),
        "account must not be claimable inside the backoff window"
    );
    assert!(pool.external_refresh_tasks(10).is_empty());

    let metrics = pool.collect_external_refresh_metrics();
    assert_eq!(metrics["refresh_backing_off"], 1);
    assert_eq!(metrics["refresh_fail_total"], 1);

    let err = pool.mark_external_refresh_failed("no-such-task", "worker", "x").unwrap_err();
    assert!(matches!(err, PoolError::TaskNotFound { .. }));
}

#[tokio::test]
async fn refresh_upload_preserves_human_fields_and_overwrites_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let email = "refresh@example.com";
    let mut seed = account_data(email, "111");
    seed.full_name = "Old Name".to_string();
    seed.mail_provider = "duckmail".to_string();
    seed.mail_password = "old-password".to_string();
    std::fs::write(
        dir.path().join(format!("{}.json", email)),
        serde_json::to_string(&seed).unwrap(),
    )
    .unwrap();

    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    park_external(&pool, email);

    let claimed = pool.claim_external_refresh_tasks("worker-cycle", 1, 120);
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].full_name, "Old Name");

    let req = AccountUploadRequest {
        email: email.to_string(),
        cookies: vec![Cookie::new("__Secure-C_SES", "new-cookie", ".gemini.google")],
        authorization: "Bearer new-auth".to_string(),
        config_id: "cfg-new".to_string(),
        csesidx: "222".to_string(),
        task_id: claimed[0].task_id.clone(),
        worker_id: "worker-cycle".to_string(),
        ..Default::default()
    };
    process_account_upload(&pool, dir.path(), &req).await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join(format!("{}.json", email))).unwrap();
    let got: AccountData = serde_json::from_str(&raw).unwrap();
    assert_eq!(got.full_name, "Old Name");
    assert_eq!(got.mail_provider, "duckmail");
    assert_eq!(got.mail_password, "old-password");
    assert_eq!(got.authorization, "Bearer new-auth");
    assert_eq!(got.config_id, "cfg-new");
    assert_eq!(got.csesidx, "222");
    assert_eq!(got.cookies[0].value, "new-cookie");

    let info = pool
        .list_accounts()
        .into_iter()
        .find(|info| info.email == email)
        .expect("account still in pool");
    assert_eq!(info.status, AccountStatus::Pending);
    assert!(pool.claim_external_refresh_tasks("worker-d", 1, 120).is_empty());
}

#[tokio::test]
async fn upload_with_mismatched_lease_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "leased@example.com", "1");
    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    park_external(&pool, "leased@example.com");
    let claimed = pool.claim_external_refresh_tasks("owner", 1, 120);

    let mut req = AccountUploadRequest {
        email: "leased@example.com".to_string(),
        cookies: vec![Cookie::new("__Secure-C_SES", "x", ".gemini.google")],
        authorization: "Bearer a".to_string(),
        csesidx: "1".to_string(),
        task_id: claimed[0].task_id.clone(),
        worker_id: "thief".to_string(),
        ..Default::default()
    };
    let err = process_account_upload(&pool, dir.path(), &req).await.unwrap_err();
    assert!(matches!(err, PoolError::LeaseMismatch { .. }));

    req.task_id = "bogus-task".to_string();
    let err = process_account_upload(&pool, dir.path(), &req).await.unwrap_err();
    assert!(matches!(err, PoolError::TaskNotFound { .. }));
}

#[test]
fn mark_needs_refresh_parks_externally_when_the_mode_is_on() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "ready@example.com", "1");
    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();

    park_external(&pool, "ready@example.com");
    assert_eq!(pool.ready_count(), 0);
    assert_eq!(pool.pending_count(), 1);
    let info = &pool.list_accounts()[0];
    assert_eq!(info.status, AccountStatus::PendingExternal);
}

#[test]
fn selection_is_fair_across_ready_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let emails = ["fair1@example.com", "fair2@example.com", "fair3@example.com"];
    for (i, email) in emails.iter().enumerate() {
        write_account(dir.path(), email, &i.to_string());
    }
    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    for email in &emails {
        pool.promote_ready(email, "jwt".to_string(), chrono::Utc::now());
    }

    let mut picks: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for _ in 0..9 {
        let creds = pool.next().expect("a ready account");
        pool.mark_used(&creds.email, true);
        *picks.entry(creds.email).or_default() += 1;
    }
    for email in &emails {
        assert_eq!(picks.get(*email), Some(&3), "uneven selection: {:?}", picks);
    }
}

#[test]
fn repeated_failures_invalidate_and_optionally_delete() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "flaky@example.com", "1");
    let mut settings = test_settings();
    settings.auto_delete_401 = true;
    let pool = AccountPool::new(settings);
    pool.load(dir.path()).unwrap();
    pool.promote_ready("flaky@example.com", "jwt".to_string(), chrono::Utc::now());

    for _ in 0..3 {
        pool.mark_used("flaky@example.com", false);
    }
    let info = &pool.list_accounts()[0];
    assert_eq!(info.status, AccountStatus::Invalid);
    assert_eq!(pool.ready_count(), 0);
    assert!(
        !dir.path().join("flaky@example.com.json").exists(),
        "auto-delete must remove the file"
    );
}

#[test]
fn success_resets_the_failure_streak() {
    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "ok@example.com", "1");
    let pool = AccountPool::new(test_settings());
    pool.load(dir.path()).unwrap();
    pool.promote_ready("ok@example.com", "jwt".to_string(), chrono::Utc::now());

    pool.mark_used("ok@example.com", false);
    pool.mark_used("ok@example.com", false);
    pool.mark_used("ok@example.com", true);
    let info = &pool.list_accounts()[0];
    assert_eq!(info.fail_count, 0);
    assert_eq!(info.status, AccountStatus::Ready);
    assert_eq!(info.total_count, 3);
    assert_eq!(info.success_count, 1);
}

#[tokio::test]
async fn upload_then_worker_promotes_to_ready() {
    let server = MockServer::start().await;
    let xsrf = base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        b"0123456789abcdef",
    );
    Mock::given(method("GET"))
        .and(path("/api/getoxsrf"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            ")]}}'\n{{\"xsrfToken\":\"{}\",\"keyId\":\"kid-test\"}}",
            xsrf
        )))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(AccountPool::new(test_settings()));
    let upstream =
        Arc::new(UpstreamClient::new(None).with_base_urls(server.uri(), server.uri()));

    let req = AccountUploadRequest {
        email: "cycle@example.com".to_string(),
        full_name: "Cycle User".to_string(),
        mail_provider: "chatgpt".to_string(),
        cookies: vec![Cookie::new("__Secure-C_SES", "new-cookie", ".gemini.google")],
        authorization: "Bearer refreshed-auth".to_string(),
        config_id: "cfg-new".to_string(),
        csesidx: "4101".to_string(),
        ..Default::default()
    };
    process_account_upload(&pool, dir.path(), &req).await.unwrap();
    assert_eq!(pool.pending_count(), 1);
    assert!(dir.path().join("cycle@example.com.json").exists());

    let engine =
        RefreshEngine::new(Arc::clone(&pool), upstream, Arc::new(NoBrowser), 1);
    let outcome = engine.process_next().await.expect("one pending account");
    assert_eq!(outcome, RefreshOutcome::Promoted("cycle@example.com".to_string()));
    assert_eq!(pool.ready_count(), 1);
    assert_eq!(pool.pending_count(), 0);

    let info = &pool.list_accounts()[0];
    assert_eq!(info.status, AccountStatus::Ready);
    assert!(info.jwt_expires.is_some(), "JWT must be cached after the mint");
    assert_eq!(
        pool.account_data("cycle@example.com").unwrap().authorization,
        "Bearer refreshed-auth"
    );
}

#[tokio::test]
async fn worker_invalidates_on_auth_failure_without_browser() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/getoxsrf"))
        .respond_with(ResponseTemplate::new(401).set_body_string("UNAUTHENTICATED"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    write_account(dir.path(), "bad@example.com", "1");
    let pool = Arc::new(AccountPool::new(test_settings()));
    pool.load(dir.path()).unwrap();
    let upstream =
        Arc::new(UpstreamClient::new(None).with_base_urls(server.uri(), server.uri()));

    let engine = RefreshEngine::new(Arc::clone(&pool), upstream, Arc::new(NoBrowser), 1);
    let outcome = engine.process_next().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Invalidated("bad@example.com".to_string()));
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.list_accounts()[0].status, AccountStatus::Invalid);
}

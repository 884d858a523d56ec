//! Internal refresh engine: a fixed pool of workers that long-poll pending
//! accounts, mint JWTs, and promote accounts to ready.
//!
//! Accounts parked as `pending_external` are never touched here; they wait
//! for the registrar claim/upload cycle, which drops them back into the
//! normal pending queue on success.

use crate::collab::BrowserAutomation;
use crate::pool::{AccountPool, CredentialSnapshot};
use crate::upstream::UpstreamClient;
use chrono::{Duration as ChronoDuration, Utc};
use gembiz_types::error::UpstreamError;
use std::sync::Arc;
use std::time::Duration;

/// How long an idle worker sleeps between pending-queue polls when no
/// wakeup signal arrives.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What one refresh pass did.
#[derive(Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Promoted(String),
    Requeued(String),
    Invalidated(String),
}

pub struct RefreshEngine {
    pool: Arc<AccountPool>,
    upstream: Arc<UpstreamClient>,
    browser: Arc<dyn BrowserAutomation>,
    workers: usize,
}

impl RefreshEngine {
    pub fn new(
        pool: Arc<AccountPool>,
        upstream: Arc<UpstreamClient>,
        browser: Arc<dyn BrowserAutomation>,
        workers: usize,
    ) -> Self {
        Self { pool, upstream, browser, workers: workers.max(1) }
    }

    /// Spawn the worker tasks. They run for the life of the process.
    pub fn spawn(self: Arc<Self>) {
        for id in 0..self.workers {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                tracing::info!("Refresh worker {} started", id);
                loop {
                    while engine.process_next().await.is_some() {}
                    tokio::select! {
                        _ = engine.pool.refresh_wakeup() => {}
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            });
        }
    }

    /// Take one pending account through a refresh attempt. Returns `None`
    /// when the pending queue has no eligible account.
    pub async fn process_next(&self) -> Option<RefreshOutcome> {
        let snapshot = self.pool.get_pending_account()?;
        let email = snapshot.email.clone();
        match self.refresh_account(snapshot).await {
            Ok(minted) => {
                let expires_at = Utc::now() + ChronoDuration::seconds(minted.expires_in as i64);
                self.pool.promote_ready(&email, minted.token, expires_at);
                tracing::info!("Account {} promoted to ready", email);
                Some(RefreshOutcome::Promoted(email))
            }
            Err(RefreshFailure::Transient(message)) => {
                tracing::warn!("Refresh for {} hit a transient error: {}", email, message);
                self.pool.requeue_pending(&email);
                Some(RefreshOutcome::Requeued(email))
            }
            Err(RefreshFailure::Auth { was_401 }) => {
                let settings = self.pool.settings();
                let delete = settings.auto_delete_401 && was_401;
                self.pool.mark_invalid(&email, "credential refresh failed", delete);
                Some(RefreshOutcome::Invalidated(email))
            }
        }
    }

    /// Mint a JWT for the account; on auth failure, optionally run the
    /// browser collaborator and retry once with the fresh credentials.
    async fn refresh_account(
        &self,
        snapshot: CredentialSnapshot,
    ) -> Result<crate::upstream::MintedJwt, RefreshFailure> {
        let email = snapshot.email.clone();
        match self.upstream.mint_jwt(&snapshot).await {
            Ok(minted) => Ok(minted),
            Err(err) => {
                let (is_auth, was_401) = classify(&err);
                if !is_auth {
                    return Err(RefreshFailure::Transient(err.to_string()));
                }
                let settings = self.pool.settings();
                if !settings.enable_browser_refresh {
                    return Err(RefreshFailure::Auth { was_401 });
                }
                tracing::info!("Invoking browser refresh for {}", email);
                let Some(data) = self.pool.account_data(&email) else {
                    return Err(RefreshFailure::Auth { was_401 });
                };
                match self
                    .browser
                    .refresh_credentials(&data, settings.browser_refresh_headless)
                    .await
                {
                    Ok(result) => {
                        self.apply_browser_result(&email, result).await;
                        let Some(data) = self.pool.account_data(&email) else {
                            return Err(RefreshFailure::Auth { was_401 });
                        };
                        let retry = CredentialSnapshot {
                            email: email.clone(),
                            authorization: data.authorization.clone(),
                            config_id: data.config_id.clone(),
                            csesidx: data.csesidx.clone(),
                            cookie_header: data.cookie_header(),
                            jwt: String::new(),
                        };
                        match self.upstream.mint_jwt(&retry).await {
                            Ok(minted) => Ok(minted),
                            Err(err) => {
                                let (_, was_401) = classify(&err);
                                Err(RefreshFailure::Auth { was_401 })
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Browser refresh for {} failed: {}", email, e);
                        Err(RefreshFailure::Auth { was_401 })
                    }
                }
            }
        }
    }

    /// Persist credentials captured by the browser collaborator.
    async fn apply_browser_result(
        &self,
        email: &str,
        result: crate::collab::BrowserRefreshResult,
    ) {
        if !self.pool.update_credentials(email, result.into()) {
            return;
        }
        if let Err(e) = self.pool.save_account(email).await {
            tracing::warn!("Failed to persist browser-refreshed account {}: {}", email, e);
        }
    }

}

enum RefreshFailure {
    /// Network-level trouble; the account stays pending.
    Transient(String),
    /// Credentials rejected or response malformed.
    Auth { was_401: bool },
}

/// (is_auth_failure, was_401)
fn classify(err: &UpstreamError) -> (bool, bool) {
    match err {
        UpstreamError::Status { status, .. } => (*status == 401 || *status == 403, *status == 401),
        UpstreamError::Malformed { .. } => (true, false),
        _ => (false, false),
    }
}


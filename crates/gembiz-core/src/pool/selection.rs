//! Selection, usage bookkeeping, and queue transitions.

use super::account::{Account, AccountInfo, CredentialSnapshot};
use super::AccountPool;
use chrono::{DateTime, Duration, Utc};
use gembiz_types::models::AccountStatus;
use serde_json::json;

impl AccountPool {
    /// Pick the ready account with the earliest `last_used` that is outside
    /// its use-cooldown, under the failure threshold, and under the daily
    /// quota. Ties break by queue insertion order.
    pub fn next(&self) -> Option<CredentialSnapshot> {
        let settings = self.settings();
        let now = Utc::now();
        let today = now.date_naive();
        let cooldown = Duration::seconds(settings.use_cooldown_sec as i64);

        let inner = self.inner.read();
        let mut best: Option<(&Account, DateTime<Utc>)> = None;
        for key in &inner.ready {
            let Some(acc) = inner.accounts.get(key) else { continue };
            if acc.status != AccountStatus::Ready {
                continue;
            }
            if acc.fail_count >= settings.max_fail_count {
                continue;
            }
            if settings.daily_limit > 0 && acc.daily_count_on(today) >= settings.daily_limit {
                continue;
            }
            if acc.cooldown_until.is_some_and(|until| until > now) {
                continue;
            }
            if acc.last_used.is_some_and(|last| now - last < cooldown) {
                continue;
            }
            let last = acc.last_used.unwrap_or(DateTime::<Utc>::MIN_UTC);
            match best {
                Some((_, best_last)) if last >= best_last => {}
                _ => best = Some((acc, last)),
            }
        }
        best.map(|(acc, _)| acc.credentials())
    }

    /// Record a use. Failures count toward the invalidation threshold;
    /// successes reset it.
    pub fn mark_used(&self, email: &str, ok: bool) {
        let key = email.trim().to_ascii_lowercase();
        let settings = self.settings();
        let now = Utc::now();
        let delete_path = {
            let mut inner = self.inner.write();
            let mut invalidated: Option<std::path::PathBuf> = None;
            match inner.accounts.get_mut(&key) {
                Some(acc) => {
                    acc.last_used = Some(now);
                    acc.total_count += 1;
                    acc.bump_daily(now.date_naive());
                    if ok {
                        acc.success_count += 1;
                        acc.fail_count = 0;
                    } else {
                        acc.fail_count += 1;
                        if acc.fail_count >= settings.max_fail_count {
                            acc.status = AccountStatus::Invalid;
                            acc.invalid_reason =
                                format!("{} consecutive failures", acc.fail_count);
                            acc.clear_jwt();
                            invalidated = Some(acc.file_path.clone());
                        }
                    }
                }
                None => return,
            }
            if invalidated.is_some() {
                inner.ready.retain(|k| k != &key);
                inner.pending.retain(|k| k != &key);
                tracing::warn!("Account {} invalidated after repeated failures", email);
            }
            invalidated.filter(|_| settings.auto_delete_401)
        };
        if let Some(path) = delete_path {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to delete invalid account file {:?}: {}", path, e);
            }
        }
    }

    /// Park a ready account for credential refresh. Under external-refresh
    /// mode the account waits for a registrar claim instead of the internal
    /// worker.
    pub fn mark_needs_refresh(&self, email: &str) {
        let key = email.trim().to_ascii_lowercase();
        let external = self.settings.read().external_refresh_mode;
        {
            let mut inner = self.inner.write();
            let move_to_pending = match inner.accounts.get_mut(&key) {
                Some(acc) => {
                    acc.clear_jwt();
                    match acc.status {
                        AccountStatus::Ready => {
                            acc.status = if external {
                                AccountStatus::PendingExternal
                            } else {
                                AccountStatus::Pending
                            };
                            true
                        }
                        AccountStatus::Pending if external => {
                            acc.status = AccountStatus::PendingExternal;
                            false
                        }
                        _ => false,
                    }
                }
                None => return,
            };
            if move_to_pending {
                inner.ready.retain(|k| k != &key);
                if !inner.pending.contains(&key) {
                    inner.pending.push(key.clone());
                }
            }
        }
        self.notify_refresh();
    }

    /// Extend the account's use-cooldown to `multiplier ×` the configured
    /// window (rate-limit and quota handling).
    pub fn extend_cooldown(&self, email: &str, multiplier: u32) {
        let key = email.trim().to_ascii_lowercase();
        let secs = self.settings.read().use_cooldown_sec * u64::from(multiplier.max(1));
        let mut inner = self.inner.write();
        if let Some(acc) = inner.accounts.get_mut(&key) {
            acc.cooldown_until = Some(Utc::now() + Duration::seconds(secs as i64));
        }
    }

    /// Pop the next internally refreshable pending account, skipping
    /// external-task accounts and accounts still inside the refresh
    /// cooldown. The account leaves the pending queue while in flight.
    pub fn get_pending_account(&self) -> Option<CredentialSnapshot> {
        let settings = self.settings();
        let now = Utc::now();
        let cooldown = Duration::seconds(settings.refresh_cooldown_sec as i64);
        let mut inner = self.inner.write();
        let idx = {
            let accounts = &inner.accounts;
            inner.pending.iter().position(|key| {
                accounts.get(key).is_some_and(|acc| {
                    acc.status == AccountStatus::Pending
                        && acc.last_refresh_attempt.is_none_or(|at| now - at >= cooldown)
                })
            })?
        };
        let key = inner.pending.remove(idx);
        let acc = inner.accounts.get_mut(&key)?;
        acc.last_refresh_attempt = Some(now);
        Some(acc.credentials())
    }

    /// Return a refresh-in-flight account to the pending queue.
    pub fn requeue_pending(&self, email: &str) {
        let key = email.trim().to_ascii_lowercase();
        let mut inner = self.inner.write();
        let active = inner.accounts.get(&key).is_some_and(|acc| acc.status.is_active());
        if active && !inner.pending.contains(&key) {
            inner.ready.retain(|k| k != &key);
            inner.pending.push(key);
        }
    }

    /// Promote a refreshed account into the ready queue with its fresh JWT.
    pub fn promote_ready(&self, email: &str, jwt: String, expires_at: DateTime<Utc>) {
        let key = email.trim().to_ascii_lowercase();
        let mut inner = self.inner.write();
        match inner.accounts.get_mut(&key) {
            Some(acc) => {
                acc.status = AccountStatus::Ready;
                acc.jwt = jwt;
                acc.jwt_expires_at = Some(expires_at);
                acc.last_refresh = Some(Utc::now());
                acc.refresh_fail_count = 0;
                acc.fail_count = 0;
            }
            None => return,
        }
        inner.pending.retain(|k| k != &key);
        if !inner.ready.contains(&key) {
            inner.ready.push(key);
        }
    }

    /// Drop an account from both queues, optionally deleting its file.
    pub fn mark_invalid(&self, email: &str, reason: &str, delete_file: bool) {
        let key = email.trim().to_ascii_lowercase();
        let path = {
            let mut inner = self.inner.write();
            inner.ready.retain(|k| k != &key);
            inner.pending.retain(|k| k != &key);
            let Some(acc) = inner.accounts.get_mut(&key) else { return };
            acc.status = AccountStatus::Invalid;
            acc.invalid_reason = reason.to_string();
            acc.clear_jwt();
            delete_file.then(|| acc.file_path.clone())
        };
        tracing::warn!("Account {} marked invalid: {}", email, reason);
        if let Some(path) = path {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to delete account file {:?}: {}", path, e);
            }
        }
    }

    /// Move every ready account back to pending. Returns how many moved.
    pub fn force_refresh_all(&self) -> usize {
        let external = self.settings.read().external_refresh_mode;
        let moved = {
            let mut inner = self.inner.write();
            let ready: Vec<String> = std::mem::take(&mut inner.ready);
            let count = ready.len();
            for key in ready {
                if let Some(acc) = inner.accounts.get_mut(&key) {
                    acc.status = if external {
                        AccountStatus::PendingExternal
                    } else {
                        AccountStatus::Pending
                    };
                    acc.clear_jwt();
                    acc.last_refresh_attempt = None;
                }
                if !inner.pending.contains(&key) {
                    inner.pending.push(key);
                }
            }
            count
        };
        self.notify_refresh();
        moved
    }

    pub fn ready_count(&self) -> usize {
        self.inner.read().ready.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    /// Active accounts (every status except invalid).
    pub fn total_count(&self) -> usize {
        self.inner.read().accounts.values().filter(|a| a.status.is_active()).count()
    }

    pub fn list_accounts(&self) -> Vec<AccountInfo> {
        let daily_limit = self.settings.read().daily_limit;
        let inner = self.inner.read();
        let mut infos: Vec<AccountInfo> =
            inner.accounts.values().map(|a| a.info(daily_limit)).collect();
        infos.sort_by(|a, b| {
            a.status
                .display_order()
                .cmp(&b.status.display_order())
                .then_with(|| a.email.to_ascii_lowercase().cmp(&b.email.to_ascii_lowercase()))
        });
        infos
    }

    pub fn account_data(&self, email: &str) -> Option<gembiz_types::models::AccountData> {
        let key = email.trim().to_ascii_lowercase();
        self.inner.read().accounts.get(&key).map(|a| a.data.clone())
    }

    /// Apply freshly captured credentials (browser refresh). Empty fields
    /// in the update leave the stored value untouched. Returns false when
    /// the account is unknown.
    pub fn update_credentials(&self, email: &str, update: super::CredentialUpdate) -> bool {
        let key = email.trim().to_ascii_lowercase();
        let mut inner = self.inner.write();
        let Some(acc) = inner.accounts.get_mut(&key) else { return false };
        if !update.cookies.is_empty() {
            acc.data.cookies = update.cookies;
        }
        if !update.authorization.is_empty() {
            acc.data.authorization = update.authorization;
        }
        if !update.config_id.is_empty() {
            acc.data.config_id = update.config_id;
        }
        if !update.csesidx.is_empty() {
            acc.data.csesidx = update.csesidx;
        }
        if !update.response_headers.is_empty() {
            acc.data.response_headers = update.response_headers;
        }
        acc.data.timestamp = Utc::now().to_rfc3339();
        acc.fail_count = 0;
        acc.clear_jwt();
        true
    }

    /// Per-status counts plus queue ages for the health report.
    pub fn stats(&self) -> serde_json::Value {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut by_status: std::collections::HashMap<&'static str, usize> =
            std::collections::HashMap::new();
        for acc in inner.accounts.values() {
            *by_status.entry(acc.status.as_str()).or_default() += 1;
        }
        let oldest_ready_idle_sec = inner
            .ready
            .iter()
            .filter_map(|k| inner.accounts.get(k))
            .filter_map(|a| a.last_used)
            .map(|t| (now - t).num_seconds().max(0))
            .max();
        json!({
            "total": inner.accounts.values().filter(|a| a.status.is_active()).count(),
            "ready": inner.ready.len(),
            "pending": inner.pending.len(),
            "pending_external": by_status.get("pending_external").copied().unwrap_or(0),
            "invalid": by_status.get("invalid").copied().unwrap_or(0),
            "oldest_ready_idle_sec": oldest_ready_idle_sec,
        })
    }
}

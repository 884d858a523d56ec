//! Registrar upload path: validation, lease matching, and the merge that
//! returns an externally refreshed account to the normal pending queue.

use super::persistence::normalize_account_data;
use super::account::Account;
use super::AccountPool;
use chrono::Utc;
use gembiz_types::error::PoolError;
use gembiz_types::models::{parse_cookie_string, AccountData, AccountStatus, Cookie};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Payload of `POST /admin/registrar/upload-account`, also the claim slip
/// returned by the lease endpoints (with `task_id`/`worker_id` set).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountUploadRequest {
    pub email: String,
    pub full_name: String,
    pub mail_provider: String,
    pub mail_password: String,
    pub cookies: Vec<Cookie>,
    pub cookie_string: String,
    pub authorization: String,
    pub authorization_source: String,
    pub config_id: String,
    pub csesidx: String,
    pub is_new: bool,
    pub task_id: String,
    pub worker_id: String,
}

impl AccountUploadRequest {
    /// Credential snapshot handed to registrar workers.
    pub(crate) fn snapshot_of(data: &AccountData) -> Self {
        Self {
            email: data.email.clone(),
            full_name: data.full_name.clone(),
            mail_provider: data.mail_provider.clone(),
            mail_password: data.mail_password.clone(),
            cookies: data.cookies.clone(),
            authorization: data.authorization.clone(),
            config_id: data.config_id.clone(),
            csesidx: data.csesidx.clone(),
            ..Self::default()
        }
    }

    fn normalized_cookies(&self) -> Vec<Cookie> {
        if !self.cookies.is_empty() {
            self.cookies.clone()
        } else {
            parse_cookie_string(&self.cookie_string)
        }
    }

    fn validate(&self, cookies: &[Cookie]) -> Result<(), PoolError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(PoolError::InvalidUpload { reason: "missing or malformed email".into() });
        }
        let has_session = cookies.iter().any(|c| {
            c.name == gembiz_types::models::SESSION_COOKIE_NAME && !c.value.is_empty()
        });
        if !has_session {
            return Err(PoolError::InvalidUpload {
                reason: format!("missing {} cookie", gembiz_types::models::SESSION_COOKIE_NAME),
            });
        }
        if self.authorization.trim().is_empty() && self.csesidx.trim().is_empty() {
            return Err(PoolError::InvalidUpload {
                reason: "missing authorization and csesidx".into(),
            });
        }
        Ok(())
    }
}

/// Validate and merge an uploaded account.
///
/// With lease context (`task_id` + `worker_id`), the upload completes an
/// external refresh: credential fields are overwritten, human-only fields
/// (`full_name`, `mail_provider`, `mail_password`) are preserved when the
/// upload leaves them empty, and the account returns to the normal pending
/// queue with its lease cleared. Without lease context the file is created
/// or overwritten as a fresh pending account.
pub async fn process_account_upload(
    pool: &AccountPool,
    data_dir: &Path,
    req: &AccountUploadRequest,
) -> Result<(), PoolError> {
    let cookies = req.normalized_cookies();
    req.validate(&cookies)?;

    let email = req.email.trim().to_string();
    let key = email.to_ascii_lowercase();
    let has_lease_context = !req.task_id.trim().is_empty();

    let save_email = {
        let mut inner = pool.inner.write();
        if has_lease_context {
            let acc = inner
                .accounts
                .get_mut(&key)
                .filter(|acc| acc.external.task_id == req.task_id)
                .ok_or_else(|| PoolError::TaskNotFound { task_id: req.task_id.clone() })?;
            if acc.external.lease_owner != req.worker_id {
                return Err(PoolError::LeaseMismatch {
                    task_id: req.task_id.clone(),
                    worker_id: req.worker_id.clone(),
                });
            }
            merge_credentials(&mut acc.data, req, &cookies);
            acc.status = AccountStatus::Pending;
            acc.external.clear_lease();
            acc.external.fail_count = 0;
            acc.external.retry_at = None;
            acc.clear_jwt();
            acc.last_refresh_attempt = None;
            acc.fail_count = 0;
        } else {
            if inner.accounts.contains_key(&key) {
                if let Some(acc) = inner.accounts.get_mut(&key) {
                    // Preserve human-only fields here too when the upload
                    // omits them.
                    merge_credentials(&mut acc.data, req, &cookies);
                    acc.data.timestamp = Utc::now().to_rfc3339();
                    acc.status = AccountStatus::Pending;
                    acc.external.clear_lease();
                    acc.clear_jwt();
                    acc.last_refresh_attempt = None;
                    acc.fail_count = 0;
                    acc.invalid_reason.clear();
                }
                inner.ready.retain(|k| k != &key);
                if !inner.pending.contains(&key) {
                    inner.pending.push(key.clone());
                }
            } else {
                let file_path = data_dir.join(format!("{}.json", email));
                let mut data = AccountData {
                    email: email.clone(),
                    full_name: req.full_name.clone(),
                    mail_provider: req.mail_provider.clone(),
                    mail_password: req.mail_password.clone(),
                    authorization: req.authorization.clone(),
                    cookies: cookies.clone(),
                    config_id: req.config_id.clone(),
                    csesidx: req.csesidx.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                    ..AccountData::default()
                };
                normalize_account_data(&mut data);
                let account = Account::new(data, file_path, AccountStatus::Pending);
                inner.pending.push(key.clone());
                inner.accounts.insert(key.clone(), account);
            }
        }
        email.clone()
    };

    pool.save_account(&save_email)
        .await
        .map_err(|e| PoolError::Persistence { message: e.to_string() })?;
    pool.notify_refresh();
    tracing::info!("Account {} accepted into pool (pending)", save_email);
    Ok(())
}

/// Overwrite credential fields from the upload; keep human-only fields when
/// the upload leaves them blank.
fn merge_credentials(data: &mut AccountData, req: &AccountUploadRequest, cookies: &[Cookie]) {
    if !req.full_name.trim().is_empty() {
        data.full_name = req.full_name.clone();
    }
    if !req.mail_provider.trim().is_empty() {
        data.mail_provider = req.mail_provider.clone();
    }
    if !req.mail_password.trim().is_empty() {
        data.mail_password = req.mail_password.clone();
    }
    data.cookies = cookies.to_vec();
    data.cookie_string.clear();
    data.csesidx = req.csesidx.clone();
    data.config_id = req.config_id.clone();
    data.authorization = if req.authorization.trim().is_empty() {
        data.fallback_authorization()
    } else {
        req.authorization.clone()
    };
    data.timestamp = Utc::now().to_rfc3339();
}

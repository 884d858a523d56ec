//! Account-file loading and atomic persistence.
//!
//! One JSON file per account, named `{email}.json`. Loads are idempotent:
//! re-running merges new files and refreshes credentials without
//! duplicating or resetting runtime state.

use super::account::Account;
use super::AccountPool;
use gembiz_types::error::AccountError;
use gembiz_types::models::{parse_cookie_string, AccountData, AccountStatus};
use std::path::Path;

/// Data-dir files that are not account records.
const SKIP_FILE_NAMES: &[&str] = &["admin_panel_auth.json"];
const SKIP_FILE_PREFIXES: &[&str] = &["invalid-backup-", "pool-export-"];

fn is_account_file(name: &str) -> bool {
    name.ends_with(".json")
        && !SKIP_FILE_NAMES.contains(&name)
        && !SKIP_FILE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Fill derived fields an on-disk record may omit: cookies parsed from the
/// raw header form, and the synthesized fallback bearer.
pub(crate) fn normalize_account_data(data: &mut AccountData) {
    data.email = data.email.trim().to_string();
    if data.cookies.is_empty() && !data.cookie_string.trim().is_empty() {
        data.cookies = parse_cookie_string(&data.cookie_string);
    }
    if data.authorization.trim().is_empty() && !data.csesidx.trim().is_empty() {
        data.authorization = data.fallback_authorization();
    }
}

/// Parse and validate one account file. Returns the (possibly stub) record
/// and the rejection reason, if any.
fn read_account_file(path: &Path, name: &str, stem: &str) -> (AccountData, Option<String>) {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            let stub = AccountData { email: stem.to_string(), ..AccountData::default() };
            return (stub, Some(format!("read failed: {}", e)));
        }
    };
    match serde_json::from_str::<AccountData>(&raw) {
        Ok(mut data) => {
            normalize_account_data(&mut data);
            let reject = data.validate().err().or_else(|| {
                (!data.email.eq_ignore_ascii_case(stem))
                    .then(|| format!("file name {} does not match email {}", name, data.email))
            });
            (data, reject)
        }
        Err(e) => {
            let stub = AccountData { email: stem.to_string(), ..AccountData::default() };
            (stub, Some(format!("json parse failed: {}", e)))
        }
    }
}

impl AccountPool {
    /// Enumerate `*.json` under `dir` and merge the records into the pool.
    /// Valid new accounts land in `pending`; records that fail validation
    /// land in the invalid bucket with their rejection reason. Returns the
    /// number of account files seen.
    pub fn load(&self, dir: &Path) -> Result<usize, AccountError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| AccountError::Io { message: format!("read_dir {:?}: {}", dir, e) })?;

        let mut seen = 0usize;
        let mut notify = false;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            if !is_account_file(&name) {
                continue;
            }
            seen += 1;
            let stem = name.trim_end_matches(".json").to_string();
            let (data, reject) = read_account_file(&path, &name, &stem);

            let key = if data.email.is_empty() {
                stem.to_ascii_lowercase()
            } else {
                data.email.to_ascii_lowercase()
            };

            let mut inner = self.inner.write();
            if inner.accounts.contains_key(&key) {
                let mut revived = false;
                if reject.is_none() {
                    if let Some(existing) = inner.accounts.get_mut(&key) {
                        existing.data = data;
                        existing.file_path = path.clone();
                        if existing.status == AccountStatus::Invalid {
                            existing.status = AccountStatus::Pending;
                            existing.invalid_reason.clear();
                            existing.fail_count = 0;
                            revived = true;
                        }
                    }
                }
                if revived {
                    if !inner.pending.contains(&key) {
                        inner.pending.push(key.clone());
                    }
                    notify = true;
                }
            } else {
                let status =
                    if reject.is_none() { AccountStatus::Pending } else { AccountStatus::Invalid };
                let mut account = Account::new(data, path.clone(), status);
                if let Some(reason) = reject {
                    tracing::warn!("Rejected account file {}: {}", name, reason);
                    account.invalid_reason = reason;
                } else {
                    inner.pending.push(key.clone());
                    notify = true;
                }
                inner.accounts.insert(key, account);
            }
        }
        if notify {
            self.notify_refresh();
        }
        Ok(seen)
    }

    /// Persist one account's data atomically (temp file, then rename).
    pub async fn save_account(&self, email: &str) -> Result<(), AccountError> {
        let key = email.trim().to_ascii_lowercase();
        let (data, path) = {
            let inner = self.inner.read();
            let acc = inner
                .accounts
                .get(&key)
                .ok_or_else(|| AccountError::NotFound { email: email.to_string() })?;
            (acc.data.clone(), acc.file_path.clone())
        };

        let lock = self.file_lock(&key);
        let _guard = lock.lock().await;
        let value = serde_json::to_value(&data)
            .map_err(|e| AccountError::Serialize { message: e.to_string() })?;
        atomic_write_json(&path, &value)
            .await
            .map_err(|message| AccountError::Io { message })
    }
}

/// Write JSON to a sibling `.tmp` file and rename it over the target. Either
/// the full new content lands or the old file stays intact.
pub async fn atomic_write_json(path: &Path, content: &serde_json::Value) -> Result<(), String> {
    let temp_path = path.with_extension("json.tmp");
    let json_str =
        serde_json::to_string_pretty(content).map_err(|e| format!("JSON serialize: {}", e))?;

    tokio::fs::write(&temp_path, &json_str)
        .await
        .map_err(|e| format!("write temp file {:?}: {}", temp_path, e))?;

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| format!("rename {:?} -> {:?}: {}", temp_path, path, e))
}

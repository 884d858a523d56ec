//! Thread-safe account pool: queue membership, selection, cooldown and
//! quota bookkeeping, external-refresh leases, and per-file persistence.
//!
//! All queue membership and status transitions happen under one
//! reader-writer lock. Network and file I/O never run while it is held.

use dashmap::DashMap;
use gembiz_types::models::AppConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

mod account;
mod external;
mod jwt;
mod persistence;
mod selection;
mod upload;

pub use account::{Account, AccountInfo, CredentialSnapshot};
pub use persistence::atomic_write_json;
pub use upload::{process_account_upload, AccountUploadRequest};

/// Credential fields captured outside the normal upload path (browser
/// refresh). Empty fields mean "keep what is stored".
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub cookies: Vec<gembiz_types::models::Cookie>,
    pub authorization: String,
    pub config_id: String,
    pub csesidx: String,
    pub response_headers: std::collections::HashMap<String, String>,
}

impl From<crate::collab::BrowserRefreshResult> for CredentialUpdate {
    fn from(result: crate::collab::BrowserRefreshResult) -> Self {
        Self {
            cookies: result.cookies,
            authorization: result.authorization,
            config_id: result.config_id,
            csesidx: result.csesidx,
            response_headers: result.response_headers,
        }
    }
}

/// Pool tuning knobs, hot-swappable from config reload.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub use_cooldown_sec: u64,
    pub refresh_cooldown_sec: u64,
    pub max_fail_count: u32,
    pub daily_limit: u32,
    pub auto_delete_401: bool,
    pub external_refresh_mode: bool,
    pub enable_browser_refresh: bool,
    pub browser_refresh_headless: bool,
    pub browser_refresh_max_retry: u32,
    pub default_config: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            use_cooldown_sec: 15,
            refresh_cooldown_sec: 240,
            max_fail_count: 3,
            daily_limit: 100,
            auto_delete_401: false,
            external_refresh_mode: false,
            enable_browser_refresh: true,
            browser_refresh_headless: false,
            browser_refresh_max_retry: 1,
            default_config: String::new(),
        }
    }
}

impl PoolSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let pool = &cfg.pool;
        Self {
            use_cooldown_sec: pool.use_cooldown_sec.max(1),
            refresh_cooldown_sec: pool.refresh_cooldown_sec.max(1),
            max_fail_count: pool.max_fail_count.max(1),
            daily_limit: pool.daily_limit,
            auto_delete_401: pool.auto_delete_401
                || (cfg.pool_server.enable
                    && cfg.pool_server.mode == "server"
                    && cfg.pool_server.expired_action == "delete"),
            external_refresh_mode: pool.external_refresh_mode,
            enable_browser_refresh: pool.enable_browser_refresh
                && pool.browser_refresh_max_retry > 0,
            browser_refresh_headless: pool.browser_refresh_headless,
            browser_refresh_max_retry: pool.browser_refresh_max_retry,
            default_config: cfg.default_config.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct PoolInner {
    /// Emails in insertion order. `ready` and `pending` are disjoint; every
    /// active account is in at most one of them.
    pub(crate) ready: Vec<String>,
    pub(crate) pending: Vec<String>,
    /// All known accounts keyed by lowercased email, invalid ones included.
    pub(crate) accounts: HashMap<String, Account>,
}

pub struct AccountPool {
    pub(crate) inner: RwLock<PoolInner>,
    pub(crate) settings: RwLock<PoolSettings>,
    pub(crate) lease_expired_total: AtomicU64,
    pub(crate) refresh_notify: tokio::sync::Notify,
    pub(crate) file_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AccountPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            settings: RwLock::new(settings),
            lease_expired_total: AtomicU64::new(0),
            refresh_notify: tokio::sync::Notify::new(),
            file_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: PoolSettings) {
        *self.settings.write() = settings;
    }

    /// Patch only the cooldown fields (admin endpoint).
    pub fn set_cooldowns(&self, refresh_cooldown_sec: u64, use_cooldown_sec: u64) {
        let mut settings = self.settings.write();
        if refresh_cooldown_sec > 0 {
            settings.refresh_cooldown_sec = refresh_cooldown_sec;
        }
        if use_cooldown_sec > 0 {
            settings.use_cooldown_sec = use_cooldown_sec;
        }
    }

    /// Wake the refresh workers; called whenever new pending work appears.
    pub fn notify_refresh(&self) {
        self.refresh_notify.notify_waiters();
        self.refresh_notify.notify_one();
    }

    /// Await a refresh wakeup signal.
    pub async fn refresh_wakeup(&self) {
        self.refresh_notify.notified().await;
    }

    pub(crate) fn file_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.file_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for AccountPool {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

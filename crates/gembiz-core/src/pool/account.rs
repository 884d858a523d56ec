//! Runtime account record owned by the pool.

use chrono::{DateTime, NaiveDate, Utc};
use gembiz_types::models::{AccountData, AccountStatus};
use serde::Serialize;
use std::path::PathBuf;

/// Lease bookkeeping for the external-refresh protocol.
#[derive(Debug, Clone, Default)]
pub struct ExternalState {
    pub task_id: String,
    pub lease_owner: String,
    pub lease_until: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
}

impl ExternalState {
    /// A lease is active until its deadline passes.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        !self.task_id.is_empty() && self.lease_until.is_some_and(|until| until > now)
    }

    /// An expired lease still carries a task id; reclaim counts it.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        !self.task_id.is_empty() && self.lease_until.is_some_and(|until| until <= now)
    }

    pub fn clear_lease(&mut self) {
        self.task_id.clear();
        self.lease_owner.clear();
        self.lease_until = None;
    }
}

/// One upstream identity plus its derived runtime state. Owned by the pool;
/// referenced everywhere else by email key.
#[derive(Debug, Clone)]
pub struct Account {
    pub data: AccountData,
    pub file_path: PathBuf,
    pub status: AccountStatus,
    pub invalid_reason: String,
    pub jwt: String,
    pub jwt_expires_at: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub refresh_fail_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub daily_count: u32,
    pub daily_day: NaiveDate,
    pub success_count: u64,
    pub total_count: u64,
    pub external: ExternalState,
}

impl Account {
    pub fn new(data: AccountData, file_path: PathBuf, status: AccountStatus) -> Self {
        Self {
            data,
            file_path,
            status,
            invalid_reason: String::new(),
            jwt: String::new(),
            jwt_expires_at: None,
            fail_count: 0,
            refresh_fail_count: 0,
            last_used: None,
            cooldown_until: None,
            last_refresh: None,
            last_refresh_attempt: None,
            daily_count: 0,
            daily_day: Utc::now().date_naive(),
            success_count: 0,
            total_count: 0,
            external: ExternalState::default(),
        }
    }

    /// Lowercased email, the pool's map key.
    pub fn key(&self) -> String {
        self.data.email.trim().to_ascii_lowercase()
    }

    /// True when the cached JWT still has at least `margin_sec` of life.
    pub fn jwt_valid(&self, now: DateTime<Utc>, margin_sec: i64) -> bool {
        !self.jwt.is_empty()
            && self
                .jwt_expires_at
                .is_some_and(|at| at - chrono::Duration::seconds(margin_sec) > now)
    }

    pub fn clear_jwt(&mut self) {
        self.jwt.clear();
        self.jwt_expires_at = None;
    }

    /// Daily counter with UTC-midnight rollover applied.
    pub fn daily_count_on(&self, day: NaiveDate) -> u32 {
        if self.daily_day == day {
            self.daily_count
        } else {
            0
        }
    }

    pub fn bump_daily(&mut self, day: NaiveDate) {
        if self.daily_day != day {
            self.daily_day = day;
            self.daily_count = 0;
        }
        self.daily_count += 1;
    }

    pub fn credentials(&self) -> CredentialSnapshot {
        CredentialSnapshot {
            email: self.data.email.clone(),
            authorization: self.data.authorization.clone(),
            config_id: self.data.config_id.clone(),
            csesidx: self.data.csesidx.clone(),
            cookie_header: self.data.cookie_header(),
            jwt: self.jwt.clone(),
        }
    }

    pub fn info(&self, daily_limit: u32) -> AccountInfo {
        let today = Utc::now().date_naive();
        let daily_count = self.daily_count_on(today);
        AccountInfo {
            email: self.data.email.clone(),
            status: self.status,
            fail_count: self.fail_count,
            last_used: self.last_used,
            last_refresh: self.last_refresh,
            daily_count,
            daily_limit,
            daily_remaining: daily_limit.saturating_sub(daily_count),
            success_count: self.success_count,
            total_count: self.total_count,
            jwt_expires: self.jwt_expires_at,
            invalid_reason: self.invalid_reason.clone(),
        }
    }
}

/// Immutable credential snapshot handed to the upstream client. Taken under
/// the pool lock, used outside it.
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub email: String,
    pub authorization: String,
    pub config_id: String,
    pub csesidx: String,
    pub cookie_header: String,
    pub jwt: String,
}

/// Read-only account summary for admin views and health reports.
#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub email: String,
    pub status: AccountStatus,
    pub fail_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub daily_count: u32,
    pub daily_limit: u32,
    pub daily_remaining: u32,
    pub success_count: u64,
    pub total_count: u64,
    pub jwt_expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invalid_reason: String,
}

//! External-refresh task protocol: list, claim with lease, fail with
//! backoff.
//!
//! A task is owned by at most one worker until its lease deadline passes or
//! the worker reports completion/failure. Claims are first-come-first-serve
//! under the pool's write lock.

use super::upload::AccountUploadRequest;
use super::AccountPool;
use chrono::{Duration, Utc};
use gembiz_types::error::PoolError;
use gembiz_types::models::AccountStatus;
use serde_json::json;
use std::sync::atomic::Ordering;
use uuid::Uuid;

/// First-failure backoff and its ceiling.
const BACKOFF_BASE_SEC: i64 = 30;
const BACKOFF_CAP_SEC: i64 = 600;

/// `30s × 2^(n-1)`, capped. `n` is the consecutive failure count, 1-based.
pub fn backoff_after_failures(n: u32) -> Duration {
    let exp = n.saturating_sub(1).min(16);
    let secs = BACKOFF_BASE_SEC.saturating_mul(1i64 << exp).min(BACKOFF_CAP_SEC);
    Duration::seconds(secs)
}

impl AccountPool {
    /// Read-only view of claimable external-refresh tasks. Does not touch
    /// lease state.
    pub fn external_refresh_tasks(&self, limit: usize) -> Vec<AccountUploadRequest> {
        let now = Utc::now();
        let inner = self.inner.read();
        inner
            .pending
            .iter()
            .filter_map(|key| inner.accounts.get(key))
            .filter(|acc| {
                acc.status == AccountStatus::PendingExternal
                    && !acc.external.lease_active(now)
                    && acc.external.retry_at.is_none_or(|at| at <= now)
            })
            .take(limit)
            .map(|acc| AccountUploadRequest::snapshot_of(&acc.data))
            .collect()
    }

    /// Atomically lease up to `limit` pending-external accounts to
    /// `worker_id`. Expired leases are forcibly reclaimed (counted in the
    /// `refresh_lease_expired_total` metric) before reassignment.
    pub fn claim_external_refresh_tasks(
        &self,
        worker_id: &str,
        limit: usize,
        lease_sec: u64,
    ) -> Vec<AccountUploadRequest> {
        if worker_id.trim().is_empty() || limit == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let lease_until = now + Duration::seconds(lease_sec.max(1) as i64);

        let mut claims = Vec::new();
        let mut inner = self.inner.write();
        let pending = inner.pending.clone();
        for key in pending {
            if claims.len() >= limit {
                break;
            }
            let Some(acc) = inner.accounts.get_mut(&key) else { continue };
            if acc.status != AccountStatus::PendingExternal {
                continue;
            }
            if acc.external.retry_at.is_some_and(|at| at > now) {
                continue;
            }
            if acc.external.lease_active(now) {
                continue;
            }
            if acc.external.lease_expired(now) {
                self.lease_expired_total.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Reclaiming expired refresh lease for {} (was {})",
                    acc.data.email,
                    acc.external.lease_owner
                );
            }
            acc.external.task_id = Uuid::new_v4().to_string();
            acc.external.lease_owner = worker_id.to_string();
            acc.external.lease_until = Some(lease_until);

            let mut slip = AccountUploadRequest::snapshot_of(&acc.data);
            slip.task_id = acc.external.task_id.clone();
            slip.worker_id = worker_id.to_string();
            claims.push(slip);
        }
        claims
    }

    /// Report a failed external refresh. Clears the lease and schedules the
    /// next claim window with exponential backoff.
    pub fn mark_external_refresh_failed(
        &self,
        task_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<(), PoolError> {
        if task_id.trim().is_empty() {
            return Err(PoolError::TaskNotFound { task_id: task_id.to_string() });
        }
        let mut inner = self.inner.write();
        let acc = inner
            .accounts
            .values_mut()
            .find(|acc| acc.external.task_id == task_id)
            .ok_or_else(|| PoolError::TaskNotFound { task_id: task_id.to_string() })?;
        if acc.external.lease_owner != worker_id {
            return Err(PoolError::LeaseMismatch {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        acc.external.clear_lease();
        acc.external.fail_count += 1;
        let backoff = backoff_after_failures(acc.external.fail_count);
        acc.external.retry_at = Some(Utc::now() + backoff);
        tracing::warn!(
            "External refresh failed for {} (attempt {}, next in {}s): {}",
            acc.data.email,
            acc.external.fail_count,
            backoff.num_seconds(),
            reason
        );
        Ok(())
    }

    /// Counters for the registrar metrics endpoint.
    pub fn collect_external_refresh_metrics(&self) -> serde_json::Value {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut pending_external = 0usize;
        let mut leased = 0usize;
        let mut backing_off = 0usize;
        let mut fail_total = 0u64;
        for acc in inner.accounts.values() {
            if acc.status != AccountStatus::PendingExternal {
                continue;
            }
            pending_external += 1;
            if acc.external.lease_active(now) {
                leased += 1;
            }
            if acc.external.retry_at.is_some_and(|at| at > now) {
                backing_off += 1;
            }
            fail_total += u64::from(acc.external.fail_count);
        }
        json!({
            "refresh_lease_expired_total": self.lease_expired_total.load(Ordering::Relaxed),
            "refresh_pending_external": pending_external,
            "refresh_leased": leased,
            "refresh_backing_off": backing_off,
            "refresh_fail_total": fail_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_after_failures(1).num_seconds(), 30);
        assert_eq!(backoff_after_failures(2).num_seconds(), 60);
        assert_eq!(backoff_after_failures(3).num_seconds(), 120);
        assert_eq!(backoff_after_failures(5).num_seconds(), 480);
        assert_eq!(backoff_after_failures(6).num_seconds(), 600);
        assert_eq!(backoff_after_failures(30).num_seconds(), 600);
    }

    #[test]
    fn backoff_is_monotone_until_the_cap() {
        let mut prev = 0;
        for n in 1..=10 {
            let cur = backoff_after_failures(n).num_seconds();
            assert!(cur >= prev);
            prev = cur;
        }
    }
}

//! Cached-JWT access: the only authentication side effect in the request
//! path.

use super::AccountPool;
use crate::upstream::UpstreamClient;
use chrono::{Duration, Utc};
use gembiz_types::error::UpstreamError;

/// Remaining life a cached JWT must have before it is re-minted.
pub const JWT_SAFETY_MARGIN_SEC: i64 = 30;

impl AccountPool {
    /// Return a usable `(jwt, config_id)` pair for the account, minting a
    /// fresh JWT through the XSRF endpoint when the cached one is missing
    /// or inside the safety margin. The mint happens outside the pool lock.
    pub async fn ensure_jwt(
        &self,
        email: &str,
        upstream: &UpstreamClient,
    ) -> Result<(String, String), UpstreamError> {
        let key = email.trim().to_ascii_lowercase();
        let default_config = self.settings.read().default_config.clone();
        let now = Utc::now();

        let snapshot = {
            let inner = self.inner.read();
            let Some(acc) = inner.accounts.get(&key) else {
                return Err(UpstreamError::Malformed {
                    message: format!("unknown account {}", email),
                });
            };
            let config_id = if acc.data.config_id.is_empty() {
                default_config.clone()
            } else {
                acc.data.config_id.clone()
            };
            if acc.jwt_valid(now, JWT_SAFETY_MARGIN_SEC) {
                return Ok((acc.jwt.clone(), config_id));
            }
            acc.credentials()
        };

        let minted = upstream.mint_jwt(&snapshot).await?;
        let expires_at = Utc::now() + Duration::seconds(minted.expires_in as i64);

        let mut inner = self.inner.write();
        let config_id = match inner.accounts.get_mut(&key) {
            Some(acc) => {
                acc.jwt = minted.token.clone();
                acc.jwt_expires_at = Some(expires_at);
                if acc.data.config_id.is_empty() {
                    default_config
                } else {
                    acc.data.config_id.clone()
                }
            }
            None => default_config,
        };
        Ok((minted.token, config_id))
    }
}

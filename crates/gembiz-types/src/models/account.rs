//! Account model and related types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cookie name the upstream uses for the business session.
pub const SESSION_COOKIE_NAME: &str = "__Secure-C_SES";
/// Domain the session cookie is scoped to.
pub const SESSION_COOKIE_DOMAIN: &str = ".gemini.google";
/// Prefix of locally synthesized bearer tokens. These stand in for a missing
/// `authorization` field and must never leave the gateway in
/// `x-original-authorization`.
pub const FALLBACK_BEARER_PREFIX: &str = "bearer fallback-csesidx-";

/// Lifecycle state of an account inside the pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Ready,
    Pending,
    Cooldown,
    PendingExternal,
    Invalid,
}

impl AccountStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending => "pending",
            Self::Cooldown => "cooldown",
            Self::PendingExternal => "pending_external",
            Self::Invalid => "invalid",
        }
    }

    /// Display ordering for admin views: healthier states sort first.
    pub const fn display_order(self) -> u8 {
        match self {
            Self::Ready => 1,
            Self::Pending => 2,
            Self::Cooldown => 3,
            Self::PendingExternal => 4,
            Self::Invalid => 5,
        }
    }

    /// An account is active while it still participates in the pool.
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Parse a user-supplied status string (admin filters).
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ready" => Some(Self::Ready),
            "pending" => Some(Self::Pending),
            "cooldown" => Some(Self::Cooldown),
            "pending_external" => Some(Self::PendingExternal),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single browser cookie carried by an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), domain: domain.into(), path: None, expires: None }
    }
}

/// On-disk account record, one JSON file per account in the data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountData {
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub full_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mail_provider: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mail_password: String,
    pub authorization: String,
    pub cookies: Vec<Cookie>,
    /// Raw `Cookie:` header form, accepted on import when `cookies` is absent.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cookie_string: String,
    pub config_id: String,
    pub csesidx: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
}

impl AccountData {
    /// The upstream session cookie, if present with a non-empty value.
    pub fn session_cookie(&self) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == SESSION_COOKIE_NAME && !c.value.is_empty())
    }

    /// Serialize the cookie set into a `Cookie:` header value.
    pub fn cookie_header(&self) -> String {
        format_cookie_string(&self.cookies)
    }

    /// True when `authorization` is a locally synthesized fallback token
    /// rather than a credential captured from the upstream.
    pub fn has_fallback_authorization(&self) -> bool {
        self.authorization.to_ascii_lowercase().starts_with(FALLBACK_BEARER_PREFIX)
    }

    /// Synthesize the fallback bearer for this account's `csesidx`.
    pub fn fallback_authorization(&self) -> String {
        format!("Bearer fallback-csesidx-{}", self.csesidx)
    }

    /// Validate the record for pool membership. Returns the rejection reason
    /// on failure.
    pub fn validate(&self) -> Result<(), String> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err("missing or malformed email".to_string());
        }
        if self.session_cookie().is_none() {
            return Err(format!("missing {SESSION_COOKIE_NAME} cookie"));
        }
        if self.authorization.trim().is_empty() && self.csesidx.trim().is_empty() {
            return Err("missing authorization and csesidx".to_string());
        }
        Ok(())
    }
}

/// Format cookies as a `Cookie:` header value (`name=value; name2=value2`).
pub fn format_cookie_string(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse a `Cookie:` header value back into cookies. The header form does not
/// carry domains, so entries are assigned the upstream session domain.
pub fn parse_cookie_string(raw: &str) -> Vec<Cookie> {
    raw.split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie::new(name, value.trim(), SESSION_COOKIE_DOMAIN))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> AccountData {
        AccountData {
            email: "user@example.com".to_string(),
            full_name: "Sample User".to_string(),
            mail_provider: "chatgpt".to_string(),
            authorization: "Bearer abc".to_string(),
            cookies: vec![
                Cookie::new(SESSION_COOKIE_NAME, "ses-value", SESSION_COOKIE_DOMAIN),
                Cookie::new("__Host-C_OSES", "oses-value", SESSION_COOKIE_DOMAIN),
            ],
            config_id: "cfg-1".to_string(),
            csesidx: "42".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            ..AccountData::default()
        }
    }

    #[test]
    fn round_trips_through_json_with_cookie_order() {
        let account = sample_account();
        let raw = serde_json::to_string(&account).unwrap();
        let back: AccountData = serde_json::from_str(&raw).unwrap();
        assert_eq!(account, back);
        assert_eq!(back.cookies[0].name, SESSION_COOKIE_NAME);
        assert_eq!(back.cookies[1].name, "__Host-C_OSES");
    }

    #[test]
    fn serializes_camel_case_field_names() {
        let raw = serde_json::to_value(sample_account()).unwrap();
        assert!(raw.get("configId").is_some());
        assert!(raw.get("fullName").is_some());
        assert!(raw.get("csesidx").is_some());
        assert!(raw.get("config_id").is_none());
    }

    #[test]
    fn cookie_string_round_trip_preserves_multiset() {
        let account = sample_account();
        let parsed = parse_cookie_string(&account.cookie_header());
        let original: Vec<_> =
            account.cookies.iter().map(|c| (c.name.clone(), c.value.clone(), c.domain.clone())).collect();
        let reparsed: Vec<_> =
            parsed.iter().map(|c| (c.name.clone(), c.value.clone(), c.domain.clone())).collect();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn validate_rejects_missing_session_cookie() {
        let mut account = sample_account();
        account.cookies.retain(|c| c.name != SESSION_COOKIE_NAME);
        assert!(account.validate().is_err());
    }

    #[test]
    fn validate_accepts_csesidx_only_credentials() {
        let mut account = sample_account();
        account.authorization.clear();
        assert!(account.validate().is_ok());
    }

    #[test]
    fn fallback_authorization_is_detected_case_insensitively() {
        let mut account = sample_account();
        account.authorization = "BEARER FALLBACK-CSESIDX-99".to_string();
        assert!(account.has_fallback_authorization());
        account.authorization = "Bearer real-token".to_string();
        assert!(!account.has_fallback_authorization());
    }

    #[test]
    fn status_ordering_matches_display_ranking() {
        assert!(AccountStatus::Ready.display_order() < AccountStatus::Pending.display_order());
        assert!(AccountStatus::Pending.display_order() < AccountStatus::Cooldown.display_order());
        assert!(
            AccountStatus::PendingExternal.display_order() < AccountStatus::Invalid.display_order()
        );
        assert!(AccountStatus::PendingExternal.is_active());
        assert!(!AccountStatus::Invalid.is_active());
    }
}

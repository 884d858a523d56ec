//! Narrow interfaces to external collaborators.
//!
//! Browser automation, registration, and Flow media generation run outside
//! this gateway. The traits here are the only coupling; the default
//! implementations simply decline.

use async_trait::async_trait;
use gembiz_types::models::{AccountData, Cookie};
use std::collections::HashMap;

/// Result of a browser-driven credential refresh or registration.
#[derive(Debug, Clone, Default)]
pub struct BrowserRefreshResult {
    pub cookies: Vec<Cookie>,
    pub authorization: String,
    pub config_id: String,
    pub csesidx: String,
    pub response_headers: HashMap<String, String>,
}

/// Browser automation collaborator (credential refresh and registration).
#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    /// Re-login with the account's cookies and capture fresh credentials.
    async fn refresh_credentials(
        &self,
        account: &AccountData,
        headless: bool,
    ) -> Result<BrowserRefreshResult, String>;

    /// Register `count` new accounts into the data directory.
    async fn register_accounts(&self, count: usize, headless: bool) -> Result<usize, String>;
}

/// Default collaborator used when no browser automation is wired in.
pub struct NoBrowser;

#[async_trait]
impl BrowserAutomation for NoBrowser {
    async fn refresh_credentials(
        &self,
        account: &AccountData,
        _headless: bool,
    ) -> Result<BrowserRefreshResult, String> {
        Err(format!("browser automation not available (account {})", account.email))
    }

    async fn register_accounts(&self, _count: usize, _headless: bool) -> Result<usize, String> {
        Err("browser automation not available".to_string())
    }
}

/// Outcome of a Flow generation request.
#[derive(Debug, Clone)]
pub struct GeneratedMedia {
    /// "image" or "video".
    pub kind: String,
    pub url: String,
}

/// Flow media-generation collaborator. When absent, Flow model names are
/// rejected and excluded from the catalogs.
#[async_trait]
pub trait MediaGenerator: Send + Sync {
    fn models(&self) -> Vec<String>;

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<GeneratedMedia, String>;
}

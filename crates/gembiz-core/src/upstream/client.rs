//! The upstream client.
//!
//! Base URLs are overridable so tests can point the client at a mock
//! server; production uses the well-known hosts.

use base64::Engine;
use gembiz_types::error::UpstreamError;
use gembiz_types::models::FALLBACK_BEARER_PREFIX;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::pool::CredentialSnapshot;

const API_BASE: &str = "https://biz-discoveryengine.googleapis.com";
const AUTH_BASE: &str = "https://business.gemini.google";
const WIDGET_PATH: &str = "/v1alpha/locations/global";

/// JWT lifetime assumed when the mint response does not carry one.
pub const DEFAULT_JWT_TTL_SEC: u64 = 270;

/// Anti-JSON-hijack prefix on auth endpoint responses.
const XSSI_PREFIX: &str = ")]}'";

/// Result of a successful JWT mint.
#[derive(Debug, Clone)]
pub struct MintedJwt {
    pub token: String,
    pub expires_in: u64,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
}

impl UpstreamClient {
    pub fn new(proxy: Option<&str>) -> Self {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(url) = proxy.filter(|u| !u.trim().is_empty()) {
            match reqwest::Proxy::all(url) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!("Invalid outbound proxy {}: {}", url, e),
            }
        }
        Self {
            http: builder.build().unwrap_or_default(),
            api_base: API_BASE.to_string(),
            auth_base: AUTH_BASE.to_string(),
        }
    }

    /// Point both endpoints at another host. Test hook.
    pub fn with_base_urls(mut self, api_base: impl Into<String>, auth_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.auth_base = auth_base.into();
        self
    }

    /// Browser-like headers shared by all widget calls. The synthesized
    /// fallback bearer must not leak upstream in
    /// `x-original-authorization`.
    fn common_headers(&self, jwt: &str, orig_auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut set = |name: &'static str, value: String| {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        };
        set("accept", "*/*".to_string());
        set("accept-language", "en-US,en;q=0.9".to_string());
        set("authorization", format!("Bearer {}", jwt));
        set("content-type", "application/json".to_string());
        set("origin", "https://business.gemini.google".to_string());
        set("referer", "https://business.gemini.google/".to_string());
        set(
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36"
                .to_string(),
        );
        set("x-server-timeout", "1800".to_string());
        set("sec-fetch-dest", "empty".to_string());
        set("sec-fetch-mode", "cors".to_string());
        set("sec-fetch-site", "cross-site".to_string());
        if !orig_auth.is_empty()
            && !orig_auth.to_ascii_lowercase().starts_with(FALLBACK_BEARER_PREFIX)
        {
            set("x-original-authorization", orig_auth.to_string());
        }
        headers
    }

    fn widget_url(&self, method: &str) -> String {
        format!("{}{}/{}", self.api_base, WIDGET_PATH, method)
    }

    async fn widget_post(
        &self,
        method: &str,
        jwt: &str,
        orig_auth: &str,
        body: &Value,
    ) -> Result<(u16, String), UpstreamError> {
        let resp = self
            .http
            .post(self.widget_url(method))
            .headers(self.common_headers(jwt, orig_auth))
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("{}: {}", method, e) })?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("{} body: {}", method, e) })?;
        Ok((status, text))
    }

    /// Mint a short-lived JWT through the XSRF endpoint using the account's
    /// cookies and original authorization.
    pub async fn mint_jwt(&self, creds: &CredentialSnapshot) -> Result<MintedJwt, UpstreamError> {
        #[derive(Deserialize)]
        struct XsrfResponse {
            #[serde(default, rename = "xsrfToken")]
            xsrf_token: String,
            #[serde(default, rename = "expiresInSeconds")]
            expires_in_seconds: Option<u64>,
        }

        let url = format!("{}/api/getoxsrf?csesidx={}", self.auth_base, creds.csesidx);
        let mut req = self.http.get(&url).header("cookie", &creds.cookie_header).header(
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36",
        );
        if !creds.authorization.is_empty() {
            req = req.header("authorization", &creds.authorization);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("getoxsrf: {}", e) })?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("getoxsrf body: {}", e) })?;
        if status != 200 {
            return Err(UpstreamError::Status { status, body: text });
        }

        let stripped = text.trim_start().strip_prefix(XSSI_PREFIX).unwrap_or(&text).trim_start();
        let parsed: XsrfResponse = serde_json::from_str(stripped)
            .map_err(|e| UpstreamError::Malformed { message: format!("xsrf response: {}", e) })?;
        if parsed.xsrf_token.is_empty() {
            return Err(UpstreamError::Malformed { message: "empty xsrfToken".to_string() });
        }
        Ok(MintedJwt {
            token: parsed.xsrf_token,
            expires_in: parsed.expires_in_seconds.unwrap_or(DEFAULT_JWT_TTL_SEC),
        })
    }

    /// Create an upstream session, retrying transient 400s. 401/403 abort
    /// immediately so the caller can rotate accounts.
    pub async fn create_session(
        &self,
        jwt: &str,
        config_id: &str,
        orig_auth: &str,
    ) -> Result<String, UpstreamError> {
        const MAX_RETRIES: u32 = 3;
        let mut last_err =
            UpstreamError::Network { message: "createSession not attempted".to_string() };
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(u64::from(attempt) * 500)).await;
                tracing::info!("createSession retry {}/{}", attempt + 1, MAX_RETRIES);
            }
            match self.create_session_once(jwt, config_id, orig_auth).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    if matches!(&err, UpstreamError::Status { status, .. } if *status == 401 || *status == 403)
                    {
                        return Err(err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn create_session_once(
        &self,
        jwt: &str,
        config_id: &str,
        orig_auth: &str,
    ) -> Result<String, UpstreamError> {
        let body = json!({
            "configId": config_id,
            "additionalParams": {"token": "-"},
            "createSessionRequest": {
                "session": {"name": "", "displayName": ""}
            }
        });
        let (status, text) = self.widget_post("widgetCreateSession", jwt, orig_auth, &body).await?;
        if status != 200 {
            return Err(UpstreamError::Status { status, body: text });
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Malformed { message: format!("session response: {}", e) })?;
        let name = value
            .pointer("/session/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(UpstreamError::Malformed { message: "session name missing".to_string() });
        }
        Ok(name)
    }

    /// Upload inline base64 media into the session. Returns the file id.
    pub async fn upload_context_file(
        &self,
        jwt: &str,
        config_id: &str,
        session: &str,
        mime_type: &str,
        base64_content: &str,
        orig_auth: &str,
    ) -> Result<String, UpstreamError> {
        let ext = mime_type.split('/').nth(1).unwrap_or("jpg");
        let file_name = format!(
            "upload_{}_{}.{}",
            chrono::Utc::now().timestamp(),
            &Uuid::new_v4().to_string()[..6],
            ext
        );
        let body = json!({
            "configId": config_id,
            "additionalParams": {"token": "-"},
            "addContextFileRequest": {
                "name": session,
                "fileName": file_name,
                "mimeType": mime_type,
                "fileContents": base64_content,
            }
        });
        self.add_context_file(jwt, orig_auth, &body).await
    }

    /// Upload media by URL, letting the upstream fetch it.
    pub async fn upload_context_file_by_url(
        &self,
        jwt: &str,
        config_id: &str,
        session: &str,
        file_url: &str,
        orig_auth: &str,
    ) -> Result<String, UpstreamError> {
        let body = json!({
            "configId": config_id,
            "additionalParams": {"token": "-"},
            "addContextFileRequest": {
                "name": session,
                "fileUri": file_url,
            }
        });
        self.add_context_file(jwt, orig_auth, &body).await
    }

    async fn add_context_file(
        &self,
        jwt: &str,
        orig_auth: &str,
        body: &Value,
    ) -> Result<String, UpstreamError> {
        let (status, text) =
            self.widget_post("widgetAddContextFile", jwt, orig_auth, body).await?;
        if status != 200 {
            return Err(UpstreamError::Status { status, body: text });
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Malformed { message: format!("upload response: {}", e) })?;
        let file_id = value
            .pointer("/addContextFileResponse/fileId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if file_id.is_empty() {
            return Err(UpstreamError::Malformed {
                message: format!("upload succeeded but fileId missing: {}", text),
            });
        }
        Ok(file_id)
    }

    /// Fire the streamAssist request and return status + raw body. The body
    /// is a JSON event array; streaming toward the client is simulated on
    /// the gateway side.
    pub async fn stream_assist(
        &self,
        jwt: &str,
        orig_auth: &str,
        body: &Value,
    ) -> Result<(u16, bytes::Bytes), UpstreamError> {
        let resp = self
            .http
            .post(self.widget_url("widgetStreamAssist"))
            .headers(self.common_headers(jwt, orig_auth))
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("streamAssist: {}", e) })?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("streamAssist body: {}", e) })?;
        Ok((status, bytes))
    }

    /// Two-step generated-file fetch: list session file metadata for the
    /// fully-qualified session path, then download. Auth failures surface
    /// as [`UpstreamError::DownloadNeedsRetry`] so the pipeline can flag
    /// the account and ask the client to resend.
    pub async fn download_generated_file(
        &self,
        jwt: &str,
        file_id: &str,
        session: &str,
        config_id: &str,
        orig_auth: &str,
    ) -> Result<String, UpstreamError> {
        const MAX_RETRIES: u32 = 2;
        if jwt.is_empty() || session.is_empty() || config_id.is_empty() {
            return Err(UpstreamError::Malformed {
                message: "missing jwt/session/configId for file download".to_string(),
            });
        }
        let mut last_err = UpstreamError::Network { message: "download not attempted".to_string() };
        for attempt in 0..MAX_RETRIES {
            match self
                .download_generated_file_once(jwt, file_id, session, config_id, orig_auth)
                .await
            {
                Ok(data) => return Ok(data),
                Err(err) => {
                    if Self::is_auth_error(&err) {
                        tracing::warn!(
                            "Generated-file download auth failure (attempt {}): {}",
                            attempt + 1,
                            err
                        );
                        return Err(UpstreamError::DownloadNeedsRetry);
                    }
                    tracing::error!(
                        "Generated-file download failed (attempt {}/{}): {}",
                        attempt + 1,
                        MAX_RETRIES,
                        err
                    );
                    last_err = err;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        }
        Err(last_err)
    }

    fn is_auth_error(err: &UpstreamError) -> bool {
        match err {
            UpstreamError::Status { status, body } => {
                *status == 401
                    || *status == 403
                    || body.contains("UNAUTHENTICATED")
                    || body.contains("SESSION_COOKIE_INVALID")
            }
            _ => false,
        }
    }

    async fn download_generated_file_once(
        &self,
        jwt: &str,
        file_id: &str,
        session: &str,
        config_id: &str,
        orig_auth: &str,
    ) -> Result<String, UpstreamError> {
        let list_body = json!({
            "configId": config_id,
            "additionalParams": {"token": "-"},
            "listSessionFileMetadataRequest": {
                "name": session,
                "filter": "file_origin_type = AI_GENERATED",
            }
        });
        let (status, text) = self
            .widget_post("widgetListSessionFileMetadata", jwt, orig_auth, &list_body)
            .await?;
        if status != 200 {
            return Err(UpstreamError::Status { status, body: text });
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| UpstreamError::Malformed {
            message: format!("file metadata response: {}", e),
        })?;
        let full_session = value
            .pointer("/listSessionFileMetadataResponse/fileMetadata")
            .and_then(Value::as_array)
            .and_then(|metas| {
                metas.iter().find(|m| {
                    m.get("fileId").and_then(Value::as_str) == Some(file_id)
                })
            })
            .and_then(|m| m.get("session").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        if full_session.is_empty() {
            return Err(UpstreamError::Malformed {
                message: format!("no metadata for fileId={}", file_id),
            });
        }

        let download_url = format!(
            "{}/download/v1alpha/{}:downloadFile?fileId={}&alt=media",
            self.api_base, full_session, file_id
        );
        let resp = self
            .http
            .get(&download_url)
            .headers(self.common_headers(jwt, orig_auth))
            .send()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("downloadFile: {}", e) })?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| UpstreamError::Network { message: format!("downloadFile body: {}", e) })?;
        if status != 200 {
            return Err(UpstreamError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(base64::engine::general_purpose::STANDARD.encode(&bytes))
    }
}

//! Application configuration model.
//!
//! Field names mirror the JSON config file (`config/config.json`); defaults
//! are the values the gateway ships with when the file is absent.

use serde::{Deserialize, Serialize};

/// Account-pool tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Target number of accounts the registrar should maintain.
    pub target_count: usize,
    /// Registration is triggered when the pool drops below this.
    pub min_count: usize,
    pub check_interval_minutes: u64,
    pub enable_go_register: bool,
    pub register_threads: usize,
    pub register_headless: bool,
    pub mail_channel_order: Vec<String>,
    pub duckmail_bearer: String,
    pub refresh_on_startup: bool,
    /// Minimum seconds between refresh attempts for one account.
    pub refresh_cooldown_sec: u64,
    /// Minimum seconds between uses of one account.
    pub use_cooldown_sec: u64,
    pub max_fail_count: u32,
    pub daily_limit: u32,
    pub enable_browser_refresh: bool,
    pub browser_refresh_headless: bool,
    /// 0 disables browser refresh entirely.
    pub browser_refresh_max_retry: u32,
    pub auto_delete_401: bool,
    pub external_refresh_mode: bool,
    pub registrar_base_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_count: 50,
            min_count: 10,
            check_interval_minutes: 30,
            enable_go_register: true,
            register_threads: 1,
            register_headless: false,
            mail_channel_order: vec!["chatgpt".to_string()],
            duckmail_bearer: String::new(),
            refresh_on_startup: true,
            refresh_cooldown_sec: 240,
            use_cooldown_sec: 15,
            max_fail_count: 3,
            daily_limit: 100,
            enable_browser_refresh: true,
            browser_refresh_headless: false,
            browser_refresh_max_retry: 1,
            auto_delete_401: false,
            external_refresh_mode: false,
            registrar_base_url: "http://127.0.0.1:8090".to_string(),
        }
    }
}

/// Flow media-generation collaborator settings. The subsystem itself lives
/// outside this gateway; only enablement and token plumbing are recognized.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    pub enable: bool,
    pub tokens: Vec<String>,
    pub proxy: String,
    pub timeout: u64,
    pub poll_interval: u64,
    pub max_poll_attempts: u32,
}

/// Cluster pool-server settings. Only recognized, never orchestrated here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolServerConfig {
    pub enable: bool,
    /// "server" or "client".
    pub mode: String,
    pub secret: String,
    pub data_dir: String,
    pub expired_action: String,
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub api_keys: Vec<String>,
    pub listen_addr: String,
    pub data_dir: String,
    pub pool: PoolConfig,
    pub proxy: String,
    pub default_config: String,
    pub pool_server: PoolServerConfig,
    pub debug: bool,
    pub flow: FlowConfig,
    /// Free-form operator notes surfaced on the root status page.
    pub note: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            listen_addr: "0.0.0.0:8000".to_string(),
            data_dir: "./data".to_string(),
            pool: PoolConfig::default(),
            proxy: String::new(),
            default_config: String::new(),
            pool_server: PoolServerConfig::default(),
            debug: false,
            flow: FlowConfig::default(),
            note: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_file_keeps_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"api_keys":["k1"],"pool":{"use_cooldown_sec":30}}"#).unwrap();
        assert_eq!(cfg.api_keys, vec!["k1".to_string()]);
        assert_eq!(cfg.pool.use_cooldown_sec, 30);
        assert_eq!(cfg.pool.refresh_cooldown_sec, 240);
        assert_eq!(cfg.listen_addr, "0.0.0.0:8000");
    }

    #[test]
    fn explicit_false_survives_deserialization() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"pool":{"external_refresh_mode":false,"enable_go_register":false}}"#)
                .unwrap();
        assert!(!cfg.pool.external_refresh_mode);
        assert!(!cfg.pool.enable_go_register);
    }
}

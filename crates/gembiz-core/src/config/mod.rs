//! Configuration loading, env overrides, and hot reload.
//!
//! Load order: built-in defaults → `config/config.json` → environment.
//! A notify-based watcher re-parses the file on change (debounced) and
//! applies only the hot-reload-safe field set; listen address, data dir,
//! and pool-server mode are read once at startup.

use gembiz_types::models::{AppConfig, PoolConfig};
use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pool::{AccountPool, PoolSettings};

pub const CONFIG_PATH: &str = "config/config.json";
const DEBOUNCE: Duration = Duration::from_millis(500);

pub type SharedConfig = Arc<RwLock<AppConfig>>;

pub fn shared(config: AppConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// Load the full configuration: defaults, file, then env overrides. A
/// missing file is created from the defaults.
pub fn load(path: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
            Ok(loaded) => {
                let raw_value: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                merge(&mut config, loaded, &raw_value);
                tracing::info!("Loaded config file: {}", path.display());
            }
            Err(e) => {
                tracing::warn!("Config file parse failed ({}), using defaults", e);
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Config file missing, writing defaults to {}", path.display());
            if let Err(e) = save_default(path, &config) {
                tracing::error!("Failed to write default config: {}", e);
            }
        }
        Err(e) => {
            tracing::warn!("Config file unreadable ({}), using defaults", e);
        }
    }
    apply_env(&mut config);
    normalize(&mut config);
    config
}

/// Overlay `loaded` onto `base`. Non-zero / non-empty values win; booleans
/// overwrite, except the two flags whose explicit `false` is only honoured
/// when the key is actually present in the file.
pub fn merge(base: &mut AppConfig, loaded: AppConfig, raw: &Value) {
    if !loaded.api_keys.is_empty() {
        base.api_keys = loaded.api_keys;
    }
    if !loaded.listen_addr.is_empty() {
        base.listen_addr = loaded.listen_addr;
    }
    if !loaded.data_dir.is_empty() {
        base.data_dir = loaded.data_dir;
    }
    if !loaded.proxy.is_empty() {
        base.proxy = loaded.proxy;
    }
    if !loaded.default_config.is_empty() {
        base.default_config = loaded.default_config;
    }
    base.debug = loaded.debug;
    base.pool_server = loaded.pool_server;
    base.flow = loaded.flow;
    if !loaded.note.is_empty() {
        base.note = loaded.note;
    }

    merge_pool(&mut base.pool, loaded.pool);
    if let Some(v) = pool_bool_field(raw, "enable_go_register") {
        base.pool.enable_go_register = v;
    }
    if let Some(v) = pool_bool_field(raw, "external_refresh_mode") {
        base.pool.external_refresh_mode = v;
    }
}

fn merge_pool(base: &mut PoolConfig, loaded: PoolConfig) {
    if loaded.target_count > 0 {
        base.target_count = loaded.target_count;
    }
    if loaded.min_count > 0 {
        base.min_count = loaded.min_count;
    }
    if loaded.check_interval_minutes > 0 {
        base.check_interval_minutes = loaded.check_interval_minutes;
    }
    if loaded.register_threads > 0 {
        base.register_threads = loaded.register_threads;
    }
    if !loaded.mail_channel_order.is_empty() {
        base.mail_channel_order = normalize_mail_channel_order(&loaded.mail_channel_order);
    }
    if !loaded.duckmail_bearer.trim().is_empty() {
        base.duckmail_bearer = loaded.duckmail_bearer.trim().to_string();
    }
    if !loaded.registrar_base_url.trim().is_empty() {
        base.registrar_base_url = loaded.registrar_base_url.trim().to_string();
    }
    base.register_headless = loaded.register_headless;
    base.refresh_on_startup = loaded.refresh_on_startup;
    base.enable_browser_refresh = loaded.enable_browser_refresh;
    base.browser_refresh_headless = loaded.browser_refresh_headless;
    base.auto_delete_401 = loaded.auto_delete_401;
    if loaded.refresh_cooldown_sec > 0 {
        base.refresh_cooldown_sec = loaded.refresh_cooldown_sec;
    }
    if loaded.use_cooldown_sec > 0 {
        base.use_cooldown_sec = loaded.use_cooldown_sec;
    }
    if loaded.max_fail_count > 0 {
        base.max_fail_count = loaded.max_fail_count;
    }
    if loaded.daily_limit > 0 {
        base.daily_limit = loaded.daily_limit;
    }
    if loaded.browser_refresh_max_retry > 0 {
        base.browser_refresh_max_retry = loaded.browser_refresh_max_retry;
    }
}

/// Presence-aware read of a `pool.*` boolean from the raw file JSON.
fn pool_bool_field(raw: &Value, field: &str) -> Option<bool> {
    raw.pointer(&format!("/pool/{}", field)).and_then(Value::as_bool)
}

/// Keep only the known mail channels, deduplicated; default to chatgpt.
pub fn normalize_mail_channel_order(order: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<String> = order
        .iter()
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| (c == "duckmail" || c == "chatgpt") && seen.insert(c.clone()))
        .collect();
    if out.is_empty() {
        out.push("chatgpt".to_string());
    }
    out
}

/// Environment overrides from §6 of the interface contract.
pub fn apply_env(config: &mut AppConfig) {
    let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    if let Some(v) = env("LISTEN_ADDR") {
        config.listen_addr = v;
    }
    if let Some(v) = env("DATA_DIR") {
        config.data_dir = v;
    }
    if let Some(v) = env("PROXY") {
        config.proxy = v;
    }
    if let Some(v) = env("CONFIG_ID") {
        config.default_config = v;
    }
    if let Some(v) = env("API_KEYS") {
        config.api_keys =
            v.split(',').map(str::trim).filter(|k| !k.is_empty()).map(str::to_string).collect();
    }
    if let Some(v) = env("API_KEY") {
        config.api_keys.push(v);
    }
    if let Some(v) = env("POOL_SERVER_SECRET") {
        config.pool_server.secret = v;
    }
    if let Some(v) = env("DUCKMAIL_BEARER") {
        config.pool.duckmail_bearer = v;
    }
}

fn normalize(config: &mut AppConfig) {
    // A bare ":8000" is accepted for compatibility and bound on all
    // interfaces.
    if config.listen_addr.starts_with(':') {
        config.listen_addr = format!("0.0.0.0{}", config.listen_addr);
    }
    config.pool.mail_channel_order = normalize_mail_channel_order(&config.pool.mail_channel_order);
}

pub fn save_default(path: &Path, config: &AppConfig) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| format!("create config dir: {}", e))?;
    }
    let raw = serde_json::to_string_pretty(config).map_err(|e| format!("serialize: {}", e))?;
    std::fs::write(path, raw).map_err(|e| format!("write config: {}", e))
}

/// Re-read the config file and swap in the hot-reloadable fields, pushing
/// the pool-related ones into the pool's settings.
pub fn reload(path: &Path, shared: &SharedConfig, pool: &AccountPool) -> Result<(), String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("read config: {}", e))?;
    let loaded: AppConfig =
        serde_json::from_str(&raw).map_err(|e| format!("parse config: {}", e))?;
    let raw_value: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);

    {
        let mut config = shared.write();
        let old_debug = config.debug;
        config.api_keys = loaded.api_keys.clone();
        config.debug = loaded.debug;
        config.note = loaded.note.clone();
        if loaded.pool.refresh_cooldown_sec > 0 {
            config.pool.refresh_cooldown_sec = loaded.pool.refresh_cooldown_sec;
        }
        if loaded.pool.use_cooldown_sec > 0 {
            config.pool.use_cooldown_sec = loaded.pool.use_cooldown_sec;
        }
        if loaded.pool.max_fail_count > 0 {
            config.pool.max_fail_count = loaded.pool.max_fail_count;
        }
        if loaded.pool.daily_limit > 0 {
            config.pool.daily_limit = loaded.pool.daily_limit;
        }
        config.pool.enable_browser_refresh = loaded.pool.enable_browser_refresh;
        config.pool.browser_refresh_headless = loaded.pool.browser_refresh_headless;
        if loaded.pool.browser_refresh_max_retry > 0 {
            config.pool.browser_refresh_max_retry = loaded.pool.browser_refresh_max_retry;
        }
        config.pool.auto_delete_401 = loaded.pool.auto_delete_401;
        if let Some(v) = pool_bool_field(&raw_value, "enable_go_register") {
            config.pool.enable_go_register = v;
        }
        if let Some(v) = pool_bool_field(&raw_value, "external_refresh_mode") {
            config.pool.external_refresh_mode = v;
        }
        config.pool.mail_channel_order =
            normalize_mail_channel_order(&loaded.pool.mail_channel_order);
        config.pool.duckmail_bearer = loaded.pool.duckmail_bearer.trim().to_string();
        if !loaded.pool.registrar_base_url.trim().is_empty() {
            config.pool.registrar_base_url = loaded.pool.registrar_base_url.trim().to_string();
        }
        if old_debug != config.debug {
            tracing::info!("Debug mode: {} -> {}", old_debug, config.debug);
        }
        pool.update_settings(PoolSettings::from_config(&config));
    }
    tracing::info!("Config reloaded");
    Ok(())
}

/// Keeps the file watcher alive; dropping it stops hot reload.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// Watch the config file's directory and reload on write/create events,
/// debounced to at least 500 ms apart.
pub fn spawn_watcher(
    path: PathBuf,
    shared: SharedConfig,
    pool: Arc<AccountPool>,
) -> Result<ConfigWatcher, String> {
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher =
        notify::recommended_watcher(tx).map_err(|e| format!("create watcher: {}", e))?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| format!("watch {}: {}", dir.display(), e))?;

    let file_name = path.file_name().map(|n| n.to_os_string());
    let path_display = path.display().to_string();
    std::thread::spawn(move || {
        let mut last_reload = Instant::now() - DEBOUNCE;
        for event in rx {
            let Ok(event) = event else { continue };
            if !matches!(
                event.kind,
                notify::EventKind::Modify(_) | notify::EventKind::Create(_)
            ) {
                continue;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| Some(n.to_os_string()) == file_name).unwrap_or(false));
            if !touches_config {
                continue;
            }
            if last_reload.elapsed() < DEBOUNCE {
                continue;
            }
            last_reload = Instant::now();
            // Let the writer finish before re-parsing.
            std::thread::sleep(Duration::from_millis(100));
            tracing::info!("Config file changed, reloading");
            if let Err(e) = reload(&path, &shared, &pool) {
                tracing::error!("Config reload failed: {}", e);
            }
        }
    });

    tracing::info!("Config hot reload enabled: {}", path_display);
    Ok(ConfigWatcher { _watcher: watcher })
}

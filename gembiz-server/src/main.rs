//! gembiz headless gateway daemon.
//!
//! Multiplexes pooled Gemini Business accounts behind OpenAI-, Claude-, and
//! Gemini-compatible chat endpoints, with an authenticated admin surface
//! for pool maintenance and the external registrar protocol.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod api;
mod cli;
mod router;

use gembiz_core::adminauth::{CredentialStore, SessionManager};
use gembiz_core::collab::NoBrowser;
use gembiz_core::logstream::{BroadcastLayer, LogBuffer};
use gembiz_core::pool::{AccountPool, PoolSettings};
use gembiz_core::proxy::GatewayState;
use gembiz_core::refresh::RefreshEngine;
use gembiz_core::stats::{ApiStats, IpStats};
use gembiz_core::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let logs = Arc::new(LogBuffer::new());
    init_tracing(cli.debug, Arc::clone(&logs));

    let config_path = PathBuf::from(gembiz_core::config::CONFIG_PATH);
    let mut config = gembiz_core::config::load(&config_path);
    if cli.debug {
        config.debug = true;
    }

    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let pool = Arc::new(AccountPool::new(PoolSettings::from_config(&config)));
    let loaded = pool.load(&data_dir).context("load account pool")?;
    info!(
        "Loaded {} account file(s): ready={}, pending={}",
        loaded,
        pool.ready_count(),
        pool.pending_count()
    );

    let upstream = Arc::new(UpstreamClient::new(Some(config.proxy.as_str())));
    let browser = Arc::new(NoBrowser);

    if let Some(email) = cli.refresh {
        return run_browser_refresh_mode(&pool, browser, &email).await;
    }

    if config.api_keys.is_empty() {
        tracing::warn!("No API keys configured; the API runs unauthenticated");
    }
    if !config.default_config.is_empty() {
        info!("Using default configId: {}", config.default_config);
    }
    if cli.once {
        info!("Single-pass registration mode requested");
    }
    if cli.auto {
        info!("Proxy auto-subscribe requested (handled by the proxy collaborator)");
    }

    let shared_config = gembiz_core::config::shared(config.clone());
    let _watcher = match gembiz_core::config::spawn_watcher(
        config_path,
        Arc::clone(&shared_config),
        Arc::clone(&pool),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!("Config hot reload unavailable: {}", e);
            None
        }
    };

    let refresh_engine = Arc::new(RefreshEngine::new(
        Arc::clone(&pool),
        Arc::clone(&upstream),
        browser.clone(),
        1,
    ));
    if config.pool.refresh_on_startup {
        Arc::clone(&refresh_engine).spawn();
    } else {
        info!("Startup refresh disabled; accounts stay pending until triggered");
    }

    let admin_store =
        Arc::new(CredentialStore::new(&data_dir).map_err(anyhow::Error::msg)?);

    let state = GatewayState {
        pool: Arc::clone(&pool),
        upstream,
        config: shared_config,
        api_stats: Arc::new(ApiStats::new()),
        ip_stats: Arc::new(IpStats::new()),
        media_client: reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default(),
        flow: None,
        browser,
        admin_store,
        sessions: Arc::new(SessionManager::new()),
        logs,
        start_time: chrono::Utc::now(),
    };

    let app = router::build_router(state, data_dir);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(
        "API server listening on {} (ready={}, pending={})",
        config.listen_addr,
        pool.ready_count(),
        pool.pending_count()
    );
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}

fn init_tracing(debug: bool, logs: Arc<LogBuffer>) {
    let level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer::new(logs))
        .init();
}

/// `--refresh [email]`: refresh one account with a headful browser, save,
/// and exit. Requires the browser-automation collaborator.
async fn run_browser_refresh_mode(
    pool: &Arc<AccountPool>,
    browser: Arc<NoBrowser>,
    email: &str,
) -> Result<()> {
    use gembiz_core::collab::BrowserAutomation;

    let target = if email.is_empty() {
        pool.list_accounts()
            .into_iter()
            .find(|info| info.status.is_active())
            .map(|info| info.email)
    } else {
        pool.account_data(email).map(|data| data.email)
    };
    let Some(target) = target else {
        anyhow::bail!("account not found: {}", if email.is_empty() { "(none loaded)" } else { email });
    };

    let data = pool
        .account_data(&target)
        .with_context(|| format!("account data missing for {}", target))?;
    info!("Headful browser refresh for {}", target);
    let result = browser
        .refresh_credentials(&data, false)
        .await
        .map_err(anyhow::Error::msg)
        .context("browser refresh")?;
    pool.update_credentials(&target, result.into());
    pool.save_account(&target).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    info!("Refreshed credentials saved for {}", target);
    Ok(())
}

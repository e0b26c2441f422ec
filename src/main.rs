use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feed_harvester::browser::{BrowserDriver, ChromiumDriver};
use feed_harvester::config::Config;
use feed_harvester::db::Database;
use feed_harvester::harvester::Harvester;
use feed_harvester::poller;
use feed_harvester::progress::LogProgress;
use feed_harvester::state::CrawlStateStore;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // HARVEST_* and reader settings may live in a local .env.
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting feed-harvester");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        accounts = ?config.accounts,
        batch_size = config.batch_size,
        mode = config.harvest_mode.as_str(),
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    if config.vision_enabled {
        info!(model = %config.vision_model, "Vision fallback enabled");
    } else {
        info!("Vision fallback disabled");
    }

    let driver = Arc::new(ChromiumDriver::new(config.browser_config()));
    let harvester = Harvester::new(
        &config,
        driver.clone(),
        CrawlStateStore::new(db.clone()),
        Arc::new(db),
    )
    .context("Failed to build harvester")?
    .with_progress(Arc::new(LogProgress));

    let poll_handle = tokio::spawn(async move {
        poller::poll_loop(config, harvester).await;
    });

    shutdown_signal().await;

    info!("Shutting down...");
    poll_handle.abort();
    driver.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Text logs unless `LOG_FORMAT=json`.
fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,feed_harvester=debug"));
    let json = std::env::var("LOG_FORMAT")
        .is_ok_and(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

/// Resolves on Ctrl+C or SIGTERM. The poll loop may be mid-cycle when aborted.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

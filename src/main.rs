//! GRADEGAP — trading-card grading arbitrage tracker.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, wires the scraping pipeline, and serves the HTTP
//! API with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use gradegap::api::{self, AppState};
use gradegap::cache::Cache;
use gradegap::config::AppConfig;
use gradegap::engine::{Orchestrator, Reconciler};
use gradegap::limiter::RateLimiter;
use gradegap::sources::auction::AuctionClient;
use gradegap::sources::marketplace::MarketplaceClient;
use gradegap::storage::CardStore;

const BANNER: &str = r#"
  ____ ____      _    ____  _____ ____    _    ____
 / ___|  _ \    / \  |  _ \| ____/ ___|  / \  |  _ \
| |  _| |_) |  / _ \ | | | |  _|| |  _  / _ \ | |_) |
| |_| |  _ <  / ___ \| |_| | |__| |_| |/ ___ \|  __/
 \____|_| \_\/_/   \_\____/|_____\____/_/   \_\_|

  Grading Arbitrage Tracker
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        port = cfg.server.port,
        database_url = %cfg.storage.database_url,
        cache_path = %cfg.cache.path,
        "GRADEGAP starting up"
    );

    // -- Storage ----------------------------------------------------------

    let store = CardStore::connect(&cfg.storage.database_url).await?;
    store.init_schema().await?;

    // -- Pipeline ---------------------------------------------------------

    let limiter = Arc::new(RateLimiter::new(
        cfg.scraper.max_requests_per_minute_marketplace,
        cfg.scraper.max_requests_per_minute_auction,
    ));
    let request_timeout = Duration::from_secs(cfg.scraper.request_timeout_secs);

    let marketplace = MarketplaceClient::new(
        limiter.clone(),
        request_timeout,
        cfg.scraper.max_retries,
    )?;
    let auction = AuctionClient::new(limiter, request_timeout)?;

    let cache = Arc::new(Cache::file_backed(&cfg.cache.path, cfg.cache.ttl_hours));
    let reconciler = Reconciler::new(Arc::new(auction), cache.clone(), cfg.scraper.fetch_concurrency);
    let orchestrator = Orchestrator::new(
        Arc::new(marketplace),
        reconciler,
        store.clone(),
        cache,
        cfg.sets.clone(),
        cfg.scraper.fetch_concurrency,
    );

    // -- HTTP API ---------------------------------------------------------

    let state = Arc::new(AppState {
        orchestrator,
        store,
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.server.port)).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("GRADEGAP shut down cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Shutdown signal received.");
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gradegap=info"));

    let json_logging = std::env::var("GRADEGAP_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

mod api;
mod config;
mod db;
mod detector;
mod error;
mod fetcher;
mod monitor;
mod notifier;
mod scheduler;
mod state;
mod types;

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::error::Result;
use crate::fetcher::ApiFootballClient;
use crate::monitor::MonitorService;
use crate::notifier::TelegramNotifier;
use crate::scheduler::Scheduler;
use crate::state::FixtureStore;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let store = FixtureStore::new(pool);
    let stats = store.stats().await?;
    info!(
        "Store loaded: {} matches, {} monitored, {} alerts sent",
        stats.total_matches, stats.monitored_matches, stats.notifications_sent,
    );

    // --- External clients ---
    let source = ApiFootballClient::new(&cfg)?;
    let notifier = TelegramNotifier::new(
        cfg.telegram_bot_token.clone(),
        cfg.telegram_chat_id.clone(),
        cfg.monitor.call_timeout,
    )?;

    if cfg.monitor.leagues.is_empty() {
        warn!("LEAGUES_TO_MONITOR not set; every league returned by the source is stored");
    } else {
        info!("Monitoring leagues: {:?}", cfg.monitor.leagues);
    }
    info!(
        "Favorite threshold < {:.2}, alert window {}'-{}'",
        cfg.monitor.favorite_odds_threshold, cfg.monitor.window_start, cfg.monitor.window_end,
    );

    let service = Arc::new(MonitorService::new(
        store,
        Arc::new(source),
        Arc::new(notifier),
        cfg.monitor.clone(),
    ));

    // --- Background jobs ---
    let _jobs = Scheduler::new(&cfg, Arc::clone(&service)).spawn();

    // HTTP API server
    let app = router(ApiState { monitor: service });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

//! Service entry point: configuration, storage, ingestion scheduler, and
//! the HTTP API.

use anyhow::{Context, Result};
use riskfolio_backend::{
    api::{self, AppState},
    config::Config,
    fetch::{
        backfill::BackfillManager, binance::BinanceClient, dune::DuneClient,
        futures::FuturesFetcher, lending::LendingFetcher, spot::SpotFetcher,
    },
    scheduler::Scheduler,
    storage::Database,
};
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let config = Arc::new(Config::from_env());
    init_tracing(&config.log_level);

    info!("Starting crypto portfolio risk service");
    info!(
        "Tracked assets: spot {:?}, futures {:?}, lending {:?}",
        config.tracked_assets, config.tracked_futures_assets, config.tracked_lending_assets
    );

    let db = Database::new(&config.database_url)
        .with_context(|| format!("failed to open database at {}", config.database_url))?;

    let binance = Arc::new(BinanceClient::new(&config).context("failed to build Binance client")?);
    let spot = Arc::new(SpotFetcher::new(
        binance.clone(),
        db.clone(),
        config.tracked_assets.clone(),
    ));
    let futures = Arc::new(FuturesFetcher::new(
        binance,
        db.clone(),
        config.tracked_futures_assets.clone(),
        config.futures_funding_interval_hours as i64,
        config.futures_klines_interval.clone(),
        config.futures_oi_period.clone(),
    ));

    // Lending is optional: without a Dune key the service still serves spot
    // and futures.
    let lending = match DuneClient::new(&config) {
        Ok(client) => Some(Arc::new(LendingFetcher::new(
            Arc::new(client),
            db.clone(),
            config.tracked_lending_assets.clone(),
        ))),
        Err(e) => {
            warn!("Lending fetcher disabled: {e}");
            None
        }
    };

    let backfill = Arc::new(BackfillManager::new(
        db.clone(),
        config.clone(),
        spot.clone(),
        futures.clone(),
        lending.clone(),
    ));

    Scheduler::new(config.clone(), spot.clone(), futures, lending, backfill).spawn();

    let state = AppState {
        db,
        config: config.clone(),
        spot,
    };
    let app = api::router(state);

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("API server listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("riskfolio_backend={log_level},tower_http=info").into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

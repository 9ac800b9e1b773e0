//! One-off historical backfill runner.
//!
//! Usage: `backfill [--force]` — forces a re-run even for streams already
//! marked complete.

use anyhow::{Context, Result};
use riskfolio_backend::{
    config::Config,
    fetch::{
        backfill::{BackfillManager, BackfillStatus},
        binance::BinanceClient,
        dune::DuneClient,
        futures::FuturesFetcher,
        lending::LendingFetcher,
        spot::SpotFetcher,
    },
    storage::Database,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let config = Arc::new(Config::from_env());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("riskfolio_backend={}", config.log_level).into()),
        )
        .init();

    let force = std::env::args().any(|a| a == "--force");

    let db = Database::new(&config.database_url).context("failed to open database")?;
    let binance = Arc::new(BinanceClient::new(&config)?);
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
    let lending = match DuneClient::new(&config) {
        Ok(client) => Some(Arc::new(LendingFetcher::new(
            Arc::new(client),
            db.clone(),
            config.tracked_lending_assets.clone(),
        ))),
        Err(e) => {
            warn!("Lending backfill disabled: {e}");
            None
        }
    };

    let manager = BackfillManager::new(db, config, spot, futures, lending);

    info!("Running backfill (force = {force})");
    let reports = manager.backfill_all(force).await;

    for report in &reports {
        match report.status {
            BackfillStatus::Completed => info!(
                "  {} {}: {} rows",
                report.asset, report.metric, report.rows_fetched
            ),
            BackfillStatus::Skipped => {
                info!("  {} {}: skipped (already completed)", report.asset, report.metric)
            }
            BackfillStatus::Failed => warn!(
                "  {} {}: FAILED ({})",
                report.asset,
                report.metric,
                report.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    Ok(())
}

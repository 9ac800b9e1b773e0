//! Periodic ingestion scheduler: one non-reentrant interval loop per metric
//! family (spot, futures, lending).
//!
//! Startup order per family: backfill once (respecting completion state),
//! an immediate catch-up, then the periodic loop. A tick still running when
//! the next fires is skipped, never queued.

use crate::config::Config;
use crate::fetch::backfill::BackfillManager;
use crate::fetch::futures::FuturesFetcher;
use crate::fetch::lending::LendingFetcher;
use crate::fetch::spot::SpotFetcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub struct Scheduler {
    config: Arc<Config>,
    spot: Arc<SpotFetcher>,
    futures: Arc<FuturesFetcher>,
    lending: Option<Arc<LendingFetcher>>,
    backfill: Arc<BackfillManager>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        spot: Arc<SpotFetcher>,
        futures: Arc<FuturesFetcher>,
        lending: Option<Arc<LendingFetcher>>,
        backfill: Arc<BackfillManager>,
    ) -> Self {
        Self {
            config,
            spot,
            futures,
            lending,
            backfill,
        }
    }

    /// Spawn the three family loops and return immediately.
    pub fn spawn(self) {
        let spot_interval = Duration::from_secs(self.config.fetch_interval_hours * 3600);
        let futures_interval =
            Duration::from_secs(self.config.futures_funding_interval_hours * 3600);
        let lending_interval =
            Duration::from_secs(self.config.lending_fetch_interval_hours * 3600);

        info!(
            "Scheduler starting: spot {}h, futures {}h, lending {}h",
            self.config.fetch_interval_hours,
            self.config.futures_funding_interval_hours,
            self.config.lending_fetch_interval_hours
        );

        {
            let spot = self.spot.clone();
            let backfill = self.backfill.clone();
            tokio::spawn(async move {
                backfill.backfill_spot(false).await;

                let mut ticker = interval(spot_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    spot_tick(&spot).await;
                }
            });
        }

        {
            let futures = self.futures.clone();
            let backfill = self.backfill.clone();
            tokio::spawn(async move {
                backfill.backfill_futures(false).await;

                let mut ticker = interval(futures_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    futures_tick(&futures).await;
                }
            });
        }

        if let Some(lending) = self.lending.clone() {
            let backfill = self.backfill.clone();
            tokio::spawn(async move {
                backfill.backfill_lending(false).await;

                let mut ticker = interval(lending_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    lending_tick(&lending).await;
                }
            });
        } else {
            info!("Lending fetcher not configured; lending loop not scheduled");
        }
    }
}

async fn spot_tick(spot: &SpotFetcher) {
    info!("Starting scheduled spot fetch");

    let latest = spot.fetch_all_latest().await;
    let total_new: usize = latest.values().sum();
    info!("Spot catch-up: {total_new} new candles");

    let gaps = spot.fill_all_gaps().await;
    let total_filled: usize = gaps.values().sum();
    if total_filled > 0 {
        info!("Spot gap fill: {total_filled} candles");
    }

    info!("Scheduled spot fetch completed");
}

async fn futures_tick(futures: &FuturesFetcher) {
    info!("Starting scheduled futures fetch");

    let latest = futures.fetch_all_assets_latest().await;
    let total_new: usize = latest.values().flat_map(|m| m.values()).sum();
    info!("Futures catch-up: {total_new} new records");

    let gaps = futures.fill_all_assets_gaps().await;
    let total_filled: usize = gaps.values().flat_map(|m| m.values()).sum();
    if total_filled > 0 {
        info!("Futures gap fill: {total_filled} records");
    }

    info!("Scheduled futures fetch completed");
}

async fn lending_tick(lending: &LendingFetcher) {
    info!("Starting scheduled lending fetch");

    match lending.fetch_and_store_all().await {
        Ok(results) => {
            let total: usize = results.values().sum();
            info!("Lending fetch: {total} new snapshots");
        }
        Err(e) => error!("Scheduled lending fetch failed: {e}"),
    }
}

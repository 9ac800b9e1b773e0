//! Idempotent historical backfill across every (asset, metric) stream.
//!
//! The window logic is shared: skip completed streams, fetch only what the
//! store is missing, close gaps, and persist completion state so a crashed
//! run resumes where it stopped.

use crate::config::Config;
use crate::error::Result;
use crate::fetch::futures::{
    FundingIngest, FuturesFetcher, IndexKlinesIngest, MarkKlinesIngest, OpenInterestIngest,
    OPEN_INTEREST_RETENTION_DAYS,
};
use crate::fetch::lending::LendingFetcher;
use crate::fetch::spot::SpotFetcher;
use crate::fetch::MetricIngest;
use crate::storage::Database;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Skipped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub asset: String,
    pub metric: String,
    pub status: BackfillStatus,
    pub rows_fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run the idempotent backfill flow for one (asset, metric) stream.
///
/// 1. Skip when already completed (unless forced).
/// 2. `target_start = now - lookback`; if stored history already reaches it,
///    only close gaps.
/// 3. Otherwise fetch the missing head `[target_start, earliest - step]` (or
///    the full window when empty), catch up `[latest + step, now]`, then
///    close gaps.
/// 4. Persist `completed` with the final latest timestamp; failures persist
///    `completed = false` but keep whatever progress was made.
pub async fn backfill_metric(
    db: &Database,
    ingest: &dyn MetricIngest,
    asset: &str,
    lookback_days: i64,
    force: bool,
) -> BackfillReport {
    let metric = ingest.metric();
    let report = |status, rows, error: Option<String>| BackfillReport {
        asset: asset.to_string(),
        metric: metric.as_str().to_string(),
        status,
        rows_fetched: rows,
        error,
    };

    match db.is_backfill_completed(asset, metric) {
        Ok(true) if !force => {
            info!("Backfill already completed for {asset}/{}, skipping", metric.as_str());
            return report(BackfillStatus::Skipped, 0, None);
        }
        Ok(_) => {}
        Err(e) => return report(BackfillStatus::Failed, 0, Some(e.to_string())),
    }

    let now = Utc::now();
    let target_start = now - Duration::days(lookback_days);
    let step = ingest.step();

    let result: Result<usize> = async {
        let earliest = db.earliest_timestamp(metric, asset)?;
        let latest = db.latest_timestamp(metric, asset)?;
        let mut total = 0usize;

        match (earliest, latest) {
            (Some(e), Some(l)) if e <= target_start => {
                info!(
                    "{asset}/{} already covers the target window, filling gaps only",
                    metric.as_str()
                );
                total += ingest.fill_gaps(asset).await?;
                let catch_up_start = l + step;
                if catch_up_start < now {
                    total += ingest.fetch_range(asset, catch_up_start, now).await?;
                }
            }
            (Some(e), l) => {
                // Fetch the missing head before existing data.
                let head_end = e - step;
                if target_start <= head_end {
                    total += ingest.fetch_range(asset, target_start, head_end).await?;
                }
                if let Some(l) = l {
                    let catch_up_start = l + step;
                    if catch_up_start < now {
                        total += ingest.fetch_range(asset, catch_up_start, now).await?;
                    }
                }
                total += ingest.fill_gaps(asset).await?;
            }
            (None, _) => {
                info!(
                    "No existing data for {asset}/{}, fetching full {lookback_days}d window",
                    metric.as_str()
                );
                total += ingest.fetch_range(asset, target_start, now).await?;
                total += ingest.fill_gaps(asset).await?;
            }
        }

        let final_latest = db.latest_timestamp(metric, asset)?;
        db.set_backfill_state(asset, metric, true, final_latest)?;
        Ok(total)
    }
    .await;

    match result {
        Ok(rows) => {
            info!(
                "Backfill completed for {asset}/{}: {rows} rows",
                metric.as_str()
            );
            report(BackfillStatus::Completed, rows, None)
        }
        Err(e) => {
            error!("Backfill failed for {asset}/{}: {e}", metric.as_str());
            let progress = db.latest_timestamp(metric, asset).ok().flatten();
            let _ = db.set_backfill_state(asset, metric, false, progress);
            report(BackfillStatus::Failed, 0, Some(e.to_string()))
        }
    }
}

/// Drives backfill across all tracked assets and metric families.
pub struct BackfillManager {
    db: Database,
    config: Arc<Config>,
    spot: Arc<SpotFetcher>,
    futures: Arc<FuturesFetcher>,
    lending: Option<Arc<LendingFetcher>>,
}

impl BackfillManager {
    pub fn new(
        db: Database,
        config: Arc<Config>,
        spot: Arc<SpotFetcher>,
        futures: Arc<FuturesFetcher>,
        lending: Option<Arc<LendingFetcher>>,
    ) -> Self {
        Self {
            db,
            config,
            spot,
            futures,
            lending,
        }
    }

    pub async fn backfill_spot(&self, force: bool) -> Vec<BackfillReport> {
        let lookback = self.config.initial_backfill_days;
        let mut reports = Vec::new();
        for asset in self.spot.assets().to_vec() {
            reports.push(
                backfill_metric(&self.db, self.spot.as_ref(), &asset, lookback, force).await,
            );
        }
        reports
    }

    pub async fn backfill_futures(&self, force: bool) -> Vec<BackfillReport> {
        let lookback = self.config.initial_backfill_days;
        let funding = FundingIngest(self.futures.clone());
        let mark = MarkKlinesIngest(self.futures.clone());
        let index = IndexKlinesIngest(self.futures.clone());
        let oi = OpenInterestIngest(self.futures.clone());

        let mut reports = Vec::new();
        for asset in self.futures.assets().to_vec() {
            reports.push(backfill_metric(&self.db, &funding, &asset, lookback, force).await);
            reports.push(backfill_metric(&self.db, &mark, &asset, lookback, force).await);
            reports.push(backfill_metric(&self.db, &index, &asset, lookback, force).await);
            // Open interest is hard-capped at provider retention no matter
            // the configured target.
            reports.push(
                backfill_metric(
                    &self.db,
                    &oi,
                    &asset,
                    lookback.min(OPEN_INTEREST_RETENTION_DAYS),
                    force,
                )
                .await,
            );
        }
        reports
    }

    pub async fn backfill_lending(&self, force: bool) -> Vec<BackfillReport> {
        let Some(lending) = &self.lending else {
            return Vec::new();
        };

        match lending.backfill_all(force).await {
            Ok(results) => results
                .into_iter()
                .map(|(asset, rows)| BackfillReport {
                    asset,
                    metric: "lending".to_string(),
                    status: BackfillStatus::Completed,
                    rows_fetched: rows,
                    error: None,
                })
                .collect(),
            Err(e) => {
                error!("Lending backfill failed: {e}");
                lending
                    .assets()
                    .iter()
                    .map(|asset| BackfillReport {
                        asset: asset.clone(),
                        metric: "lending".to_string(),
                        status: BackfillStatus::Failed,
                        rows_fetched: 0,
                        error: Some(e.to_string()),
                    })
                    .collect()
            }
        }
    }

    /// Full startup backfill. Per-(asset, metric) failures never abort the
    /// rest of the run.
    pub async fn backfill_all(&self, force: bool) -> Vec<BackfillReport> {
        let mut reports = self.backfill_spot(force).await;
        reports.extend(self.backfill_futures(force).await);
        reports.extend(self.backfill_lending(force).await);

        let completed = reports
            .iter()
            .filter(|r| r.status == BackfillStatus::Completed)
            .count();
        let failed = reports
            .iter()
            .filter(|r| r.status == BackfillStatus::Failed)
            .count();
        let skipped = reports
            .iter()
            .filter(|r| r.status == BackfillStatus::Skipped)
            .count();
        info!("Backfill summary: {completed} completed, {failed} failed, {skipped} skipped");

        reports
    }
}

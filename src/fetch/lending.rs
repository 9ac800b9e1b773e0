//! Aave lending ingestion via the Dune query executor.
//!
//! The query returns daily snapshots for every reserve in one execution, so
//! all tracked assets share a single provider call per tick. Rows are
//! validated against RAY sanity bounds before they reach storage.

use crate::error::Result;
use crate::fetch::dune::{DuneClient, DuneLendingRecord};
use crate::models::{ray_str_to_f64, LendingRow, Metric, RAY};
use crate::storage::Database;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 200% APR in RAY: upper sanity bound for any rate column.
const MAX_RATE_RAY: f64 = 2.0 * RAY;
/// Indices start at 1.0 RAY and only grow.
const MIN_INDEX_RAY: f64 = RAY;
const MAX_INDEX_RAY: f64 = 1e30;

pub struct LendingFetcher {
    client: Arc<DuneClient>,
    db: Database,
    assets: Vec<String>,
}

impl LendingFetcher {
    pub fn new(client: Arc<DuneClient>, db: Database, assets: Vec<String>) -> Self {
        Self { client, db, assets }
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Execute the lending query once and store snapshots for every tracked
    /// reserve. Returns newly stored rows per asset.
    pub async fn fetch_and_store_all(&self) -> Result<HashMap<String, usize>> {
        let records = self.client.get_lending_data().await?;
        if records.is_empty() {
            warn!("Lending query returned no rows");
            return Ok(HashMap::new());
        }

        let mut by_asset: HashMap<String, Vec<LendingRow>> = HashMap::new();
        for record in records {
            if !self.assets.contains(&record.symbol) {
                continue;
            }
            if !validate_record(&record) {
                warn!("Skipping invalid lending row for {}", record.symbol);
                continue;
            }
            by_asset
                .entry(record.symbol.clone())
                .or_default()
                .push(LendingRow {
                    timestamp: record.timestamp,
                    supply_rate_ray: record.supply_rate_ray,
                    var_borrow_rate_ray: record.var_borrow_rate_ray,
                    stable_borrow_rate_ray: record.stable_borrow_rate_ray,
                    liquidity_index: record.liquidity_index,
                    variable_borrow_index: record.variable_borrow_index,
                });
        }

        let mut results = HashMap::new();
        for (asset, rows) in by_asset {
            match self.db.upsert_lending_batch(&asset, &rows) {
                Ok(stored) => {
                    debug!("Stored {stored} lending snapshots for {asset}");
                    results.insert(asset, stored);
                }
                Err(e) => {
                    error!("Failed to store lending data for {asset}: {e}");
                    results.insert(asset, 0);
                }
            }
        }

        let total: usize = results.values().sum();
        info!(
            "Lending fetch complete: {total} new snapshots across {} assets",
            results.len()
        );
        Ok(results)
    }

    /// One-off backfill: a single execution covers the query's full history.
    /// Marks per-asset state complete; failures keep progress.
    pub async fn backfill_all(&self, force: bool) -> Result<HashMap<String, usize>> {
        let mut skipped = true;
        for asset in &self.assets {
            if force || !self.db.is_backfill_completed(asset, Metric::Lending)? {
                skipped = false;
                break;
            }
        }
        if skipped {
            info!("Lending backfill already completed for all assets, skipping");
            return Ok(HashMap::new());
        }

        match self.fetch_and_store_all().await {
            Ok(results) => {
                for asset in &self.assets {
                    let latest = self.db.latest_timestamp(Metric::Lending, asset)?;
                    self.db
                        .set_backfill_state(asset, Metric::Lending, latest.is_some(), latest)?;
                }
                Ok(results)
            }
            Err(e) => {
                for asset in &self.assets {
                    let latest = self.db.latest_timestamp(Metric::Lending, asset)?;
                    self.db
                        .set_backfill_state(asset, Metric::Lending, false, latest)?;
                }
                Err(e)
            }
        }
    }
}

/// RAY sanity checks: rates within [0, 200% APR], indices within
/// [1.0, 1000.0] RAY, timestamps not in the future.
fn validate_record(record: &DuneLendingRecord) -> bool {
    if record.timestamp > Utc::now() {
        warn!("Future lending timestamp: {}", record.timestamp);
        return false;
    }

    if !record.reserve.starts_with("0x") || record.reserve.len() != 42 {
        warn!("Invalid reserve address: {}", record.reserve);
        return false;
    }

    for rate in [
        &record.supply_rate_ray,
        &record.var_borrow_rate_ray,
        &record.stable_borrow_rate_ray,
    ] {
        match ray_str_to_f64(rate) {
            Some(v) if (0.0..=MAX_RATE_RAY).contains(&v) => {}
            _ => {
                warn!("Rate out of range (0-200% APR): {rate}");
                return false;
            }
        }
    }

    for index in [&record.liquidity_index, &record.variable_borrow_index] {
        match ray_str_to_f64(index) {
            Some(v) if (MIN_INDEX_RAY..=MAX_INDEX_RAY).contains(&v) => {}
            _ => {
                warn!("Index out of range: {index}");
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record() -> DuneLendingRecord {
        DuneLendingRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            symbol: "WETH".to_string(),
            reserve: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".to_string(),
            supply_rate_ray: "21000000000000000000000000".to_string(),
            var_borrow_rate_ray: "31000000000000000000000000".to_string(),
            stable_borrow_rate_ray: "0".to_string(),
            liquidity_index: "1040000000000000000000000000".to_string(),
            variable_borrow_index: "1050000000000000000000000000".to_string(),
        }
    }

    #[test]
    fn valid_record_passes() {
        assert!(validate_record(&record()));
    }

    #[test]
    fn rejects_out_of_range_rate() {
        let mut r = record();
        // 300% APR exceeds the 200% bound.
        r.var_borrow_rate_ray = "3000000000000000000000000000".to_string();
        assert!(!validate_record(&r));
    }

    #[test]
    fn rejects_index_below_one_ray() {
        let mut r = record();
        r.liquidity_index = "900000000000000000000000000".to_string();
        assert!(!validate_record(&r));
    }

    #[test]
    fn rejects_future_timestamp_and_bad_reserve() {
        let mut r = record();
        r.timestamp = Utc::now() + Duration::days(2);
        assert!(!validate_record(&r));

        let mut r = record();
        r.reserve = "not-an-address".to_string();
        assert!(!validate_record(&r));
    }
}

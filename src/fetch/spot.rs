//! Spot OHLCV ingestion (12h candles) with catch-up and gap filling.

use crate::error::Result;
use crate::fetch::binance::BinanceClient;
use crate::fetch::MetricIngest;
use crate::models::Metric;
use crate::storage::Database;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const SPOT_INTERVAL: &str = "12h";

pub struct SpotFetcher {
    client: Arc<BinanceClient>,
    db: Database,
    assets: Vec<String>,
}

impl SpotFetcher {
    pub fn new(client: Arc<BinanceClient>, db: Database, assets: Vec<String>) -> Self {
        Self { client, db, assets }
    }

    fn asset_to_symbol(asset: &str) -> String {
        format!("{}USDT", asset.to_uppercase())
    }

    /// Fetch one window from Binance and upsert it. Returns new rows stored.
    pub async fn fetch_and_store_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let symbol = Self::asset_to_symbol(asset);
        let candles = self
            .client
            .get_klines_paginated(&symbol, SPOT_INTERVAL, Some(start), Some(end))
            .await?;

        if candles.is_empty() {
            debug!("No spot data returned for {asset} {start} -> {end}");
            return Ok(0);
        }

        let stored = self.db.upsert_ohlcv_batch(asset, &candles)?;
        info!(
            "Stored {stored} candles for {asset} ({} -> {})",
            start.date_naive(),
            end.date_naive()
        );
        Ok(stored)
    }

    /// Catch up from the last stored candle to now.
    pub async fn fetch_latest(&self, asset: &str) -> Result<usize> {
        let Some(latest) = self.db.latest_timestamp(Metric::SpotOhlcv, asset)? else {
            info!("No existing spot data for {asset}; run backfill first");
            return Ok(0);
        };

        let next = latest + Duration::hours(12);
        let now = Utc::now();
        if next > now {
            debug!("No new spot data expected for {asset} (next: {next})");
            return Ok(0);
        }

        info!("Catching up {asset} spot from {next} to {now}");
        self.fetch_and_store_range(asset, next, now).await
    }

    /// Detect and fill missing 12h grid points. Continues past single-gap
    /// failures so one bad window cannot block the rest.
    pub async fn fill_gaps(&self, asset: &str) -> Result<usize> {
        let gaps = self
            .db
            .detect_gaps(Metric::SpotOhlcv, asset, Duration::hours(12))?;

        if gaps.is_empty() {
            debug!("No spot gaps detected for {asset}");
            return Ok(0);
        }

        info!("Detected {} spot gap(s) for {asset}", gaps.len());
        let mut filled = 0usize;
        for (gap_start, gap_end) in gaps {
            match self.fetch_and_store_range(asset, gap_start, gap_end).await {
                Ok(n) => filled += n,
                Err(e) => {
                    error!("Failed to fill spot gap for {asset} ({gap_start} -> {gap_end}): {e}");
                    continue;
                }
            }
        }
        Ok(filled)
    }

    /// Catch-up across all tracked assets; per-asset errors are isolated.
    pub async fn fetch_all_latest(&self) -> HashMap<String, usize> {
        let mut results = HashMap::new();
        for asset in &self.assets {
            match self.fetch_latest(asset).await {
                Ok(n) => {
                    results.insert(asset.clone(), n);
                }
                Err(e) => {
                    error!("Failed to fetch latest spot for {asset}: {e}");
                    results.insert(asset.clone(), 0);
                }
            }
        }
        results
    }

    pub async fn fill_all_gaps(&self) -> HashMap<String, usize> {
        let mut results = HashMap::new();
        for asset in &self.assets {
            match self.fill_gaps(asset).await {
                Ok(n) => {
                    results.insert(asset.clone(), n);
                }
                Err(e) => {
                    error!("Failed to fill spot gaps for {asset}: {e}");
                    results.insert(asset.clone(), 0);
                }
            }
        }
        results
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }
}

#[async_trait]
impl MetricIngest for SpotFetcher {
    fn metric(&self) -> Metric {
        Metric::SpotOhlcv
    }

    fn step(&self) -> Duration {
        Duration::hours(12)
    }

    async fn fetch_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        self.fetch_and_store_range(asset, start, end).await
    }

    async fn fill_gaps(&self, asset: &str) -> Result<usize> {
        SpotFetcher::fill_gaps(self, asset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_mapping() {
        assert_eq!(SpotFetcher::asset_to_symbol("BTC"), "BTCUSDT");
        assert_eq!(SpotFetcher::asset_to_symbol("sol"), "SOLUSDT");
    }
}

//! Perpetual-futures ingestion: funding rates, mark/index klines, open
//! interest. Each metric has catch-up and (except open interest) gap filling.

use crate::error::{Result, ServiceError};
use crate::fetch::binance::BinanceClient;
use crate::fetch::MetricIngest;
use crate::models::Metric;
use crate::storage::Database;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Binance keeps roughly 30 days of open-interest history; older windows
/// return empty pages and must never be treated as gaps.
pub const OPEN_INTEREST_RETENTION_DAYS: i64 = 30;

pub struct FuturesFetcher {
    client: Arc<BinanceClient>,
    db: Database,
    assets: Vec<String>,
    funding_interval_hours: i64,
    klines_interval: String,
    oi_period: String,
}

impl FuturesFetcher {
    pub fn new(
        client: Arc<BinanceClient>,
        db: Database,
        assets: Vec<String>,
        funding_interval_hours: i64,
        klines_interval: String,
        oi_period: String,
    ) -> Self {
        Self {
            client,
            db,
            assets,
            funding_interval_hours,
            klines_interval,
            oi_period,
        }
    }

    fn asset_to_symbol(asset: &str) -> String {
        format!("{}USDT", asset.to_uppercase())
    }

    pub fn funding_step(&self) -> Duration {
        Duration::hours(self.funding_interval_hours)
    }

    pub fn klines_step(&self) -> Duration {
        parse_interval(&self.klines_interval).unwrap_or_else(|_| Duration::hours(8))
    }

    pub fn oi_step(&self) -> Duration {
        parse_interval(&self.oi_period).unwrap_or_else(|_| Duration::minutes(5))
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    // ==================== funding rates ====================

    pub async fn fetch_and_store_funding(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let symbol = Self::asset_to_symbol(asset);
        let rows = self
            .client
            .get_funding_rate_history_paginated(&symbol, Some(start), Some(end))
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let stored = self.db.upsert_funding_batch(asset, &rows)?;
        info!("Stored {stored} funding rates for {asset}");
        Ok(stored)
    }

    pub async fn fetch_latest_funding(&self, asset: &str) -> Result<usize> {
        let Some(latest) = self.db.latest_timestamp(Metric::FutFunding, asset)? else {
            return Ok(0);
        };
        let next = latest + self.funding_step();
        let now = Utc::now();
        if next > now {
            return Ok(0);
        }
        self.fetch_and_store_funding(asset, next, now).await
    }

    pub async fn fill_funding_gaps(&self, asset: &str) -> Result<usize> {
        self.fill_metric_gaps(asset, Metric::FutFunding, self.funding_step())
            .await
    }

    // ==================== mark / index klines ====================

    pub async fn fetch_and_store_klines(
        &self,
        metric: Metric,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let symbol = Self::asset_to_symbol(asset);
        let rows = match metric {
            Metric::FutMarkKlines => {
                self.client
                    .get_mark_price_klines_paginated(
                        &symbol,
                        &self.klines_interval,
                        Some(start),
                        Some(end),
                    )
                    .await?
            }
            Metric::FutIndexKlines => {
                self.client
                    .get_index_price_klines_paginated(
                        &symbol,
                        &self.klines_interval,
                        Some(start),
                        Some(end),
                    )
                    .await?
            }
            other => {
                return Err(ServiceError::ProviderPermanent(format!(
                    "fetch_and_store_klines called for {}",
                    other.as_str()
                )))
            }
        };
        if rows.is_empty() {
            return Ok(0);
        }
        let stored = self.db.upsert_klines_batch(metric, asset, &rows)?;
        info!("Stored {stored} {} for {asset}", metric.as_str());
        Ok(stored)
    }

    pub async fn fetch_latest_klines(&self, metric: Metric, asset: &str) -> Result<usize> {
        let Some(latest) = self.db.latest_timestamp(metric, asset)? else {
            return Ok(0);
        };
        let next = latest + self.klines_step();
        let now = Utc::now();
        if next > now {
            return Ok(0);
        }
        self.fetch_and_store_klines(metric, asset, next, now).await
    }

    pub async fn fill_klines_gaps(&self, metric: Metric, asset: &str) -> Result<usize> {
        self.fill_metric_gaps(asset, metric, self.klines_step()).await
    }

    // ==================== open interest ====================

    /// Fetch open interest, clamping the window to provider retention.
    pub async fn fetch_and_store_open_interest(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let retention_floor = Utc::now() - Duration::days(OPEN_INTEREST_RETENTION_DAYS);
        let clamped_start = start.max(retention_floor);
        if clamped_start >= end {
            return Ok(0);
        }

        let symbol = Self::asset_to_symbol(asset);
        let rows = self
            .client
            .get_open_interest_history_paginated(
                &symbol,
                &self.oi_period,
                Some(clamped_start),
                Some(end),
            )
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let stored = self.db.upsert_open_interest_batch(asset, &rows)?;
        info!("Stored {stored} open interest points for {asset}");
        Ok(stored)
    }

    pub async fn fetch_latest_open_interest(&self, asset: &str) -> Result<usize> {
        let now = Utc::now();
        let start = match self.db.latest_timestamp(Metric::FutOpenInterest, asset)? {
            Some(latest) => {
                let next = latest + self.oi_step();
                if next > now {
                    return Ok(0);
                }
                next
            }
            None => now - Duration::days(OPEN_INTEREST_RETENTION_DAYS),
        };
        self.fetch_and_store_open_interest(asset, start, now).await
    }

    // ==================== per-asset aggregation ====================

    /// Catch up every futures metric for one asset. Failures are recorded
    /// per metric; one metric cannot abort the others.
    pub async fn fetch_latest(&self, asset: &str) -> HashMap<&'static str, usize> {
        let mut results = HashMap::new();

        match self.fetch_latest_funding(asset).await {
            Ok(n) => {
                results.insert("funding", n);
            }
            Err(e) => {
                error!("Funding catch-up failed for {asset}: {e}");
                results.insert("funding", 0);
            }
        }
        for (name, metric) in [
            ("mark_klines", Metric::FutMarkKlines),
            ("index_klines", Metric::FutIndexKlines),
        ] {
            match self.fetch_latest_klines(metric, asset).await {
                Ok(n) => {
                    results.insert(name, n);
                }
                Err(e) => {
                    error!("{name} catch-up failed for {asset}: {e}");
                    results.insert(name, 0);
                }
            }
        }
        match self.fetch_latest_open_interest(asset).await {
            Ok(n) => {
                results.insert("open_interest", n);
            }
            Err(e) => {
                error!("Open interest catch-up failed for {asset}: {e}");
                results.insert("open_interest", 0);
            }
        }

        results
    }

    /// Fill gaps for the fixed-cadence futures metrics. Open interest is
    /// retention-bounded and skipped on purpose.
    pub async fn fill_all_gaps(&self, asset: &str) -> HashMap<&'static str, usize> {
        let mut results = HashMap::new();

        match self.fill_funding_gaps(asset).await {
            Ok(n) => {
                results.insert("funding", n);
            }
            Err(e) => {
                error!("Funding gap fill failed for {asset}: {e}");
                results.insert("funding", 0);
            }
        }
        for (name, metric) in [
            ("mark_klines", Metric::FutMarkKlines),
            ("index_klines", Metric::FutIndexKlines),
        ] {
            match self.fill_klines_gaps(metric, asset).await {
                Ok(n) => {
                    results.insert(name, n);
                }
                Err(e) => {
                    error!("{name} gap fill failed for {asset}: {e}");
                    results.insert(name, 0);
                }
            }
        }

        results
    }

    pub async fn fetch_all_assets_latest(&self) -> HashMap<String, HashMap<&'static str, usize>> {
        let mut out = HashMap::new();
        for asset in &self.assets {
            out.insert(asset.clone(), self.fetch_latest(asset).await);
        }
        out
    }

    pub async fn fill_all_assets_gaps(&self) -> HashMap<String, HashMap<&'static str, usize>> {
        let mut out = HashMap::new();
        for asset in &self.assets {
            out.insert(asset.clone(), self.fill_all_gaps(asset).await);
        }
        out
    }

    async fn fill_metric_gaps(
        &self,
        asset: &str,
        metric: Metric,
        step: Duration,
    ) -> Result<usize> {
        let gaps = self.db.detect_gaps(metric, asset, step)?;
        if gaps.is_empty() {
            debug!("No {} gaps for {asset}", metric.as_str());
            return Ok(0);
        }

        info!("Detected {} {} gap(s) for {asset}", gaps.len(), metric.as_str());
        let mut filled = 0usize;
        for (gap_start, gap_end) in gaps {
            let fetched = match metric {
                Metric::FutFunding => self.fetch_and_store_funding(asset, gap_start, gap_end).await,
                Metric::FutMarkKlines | Metric::FutIndexKlines => {
                    self.fetch_and_store_klines(metric, asset, gap_start, gap_end)
                        .await
                }
                other => Err(ServiceError::ProviderPermanent(format!(
                    "gap fill not supported for {}",
                    other.as_str()
                ))),
            };
            match fetched {
                Ok(n) => filled += n,
                Err(e) => {
                    error!(
                        "Failed to fill {} gap for {asset} ({gap_start} -> {gap_end}): {e}",
                        metric.as_str()
                    );
                    continue;
                }
            }
        }
        Ok(filled)
    }
}

/// Parse intervals like "8h", "1d", "5m" into a chrono duration.
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let s = raw.trim().to_lowercase();
    let (value, unit) = s.split_at(s.len().saturating_sub(1));
    let n: i64 = value.parse().map_err(|_| {
        ServiceError::Validation(format!("unsupported interval format: {raw}"))
    })?;
    match unit {
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        _ => Err(ServiceError::Validation(format!(
            "unsupported interval format: {raw} (use 5m / 8h / 1d)"
        ))),
    }
}

// Thin per-metric views so the generic backfill flow can drive each futures
// stream through the shared MetricIngest seam.

pub struct FundingIngest(pub Arc<FuturesFetcher>);

#[async_trait]
impl MetricIngest for FundingIngest {
    fn metric(&self) -> Metric {
        Metric::FutFunding
    }

    fn step(&self) -> Duration {
        self.0.funding_step()
    }

    async fn fetch_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        self.0.fetch_and_store_funding(asset, start, end).await
    }

    async fn fill_gaps(&self, asset: &str) -> Result<usize> {
        self.0.fill_funding_gaps(asset).await
    }
}

pub struct MarkKlinesIngest(pub Arc<FuturesFetcher>);

#[async_trait]
impl MetricIngest for MarkKlinesIngest {
    fn metric(&self) -> Metric {
        Metric::FutMarkKlines
    }

    fn step(&self) -> Duration {
        self.0.klines_step()
    }

    async fn fetch_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        self.0
            .fetch_and_store_klines(Metric::FutMarkKlines, asset, start, end)
            .await
    }

    async fn fill_gaps(&self, asset: &str) -> Result<usize> {
        self.0.fill_klines_gaps(Metric::FutMarkKlines, asset).await
    }
}

pub struct IndexKlinesIngest(pub Arc<FuturesFetcher>);

#[async_trait]
impl MetricIngest for IndexKlinesIngest {
    fn metric(&self) -> Metric {
        Metric::FutIndexKlines
    }

    fn step(&self) -> Duration {
        self.0.klines_step()
    }

    async fn fetch_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        self.0
            .fetch_and_store_klines(Metric::FutIndexKlines, asset, start, end)
            .await
    }

    async fn fill_gaps(&self, asset: &str) -> Result<usize> {
        self.0.fill_klines_gaps(Metric::FutIndexKlines, asset).await
    }
}

/// Open interest: retention-bounded, no gap filling.
pub struct OpenInterestIngest(pub Arc<FuturesFetcher>);

#[async_trait]
impl MetricIngest for OpenInterestIngest {
    fn metric(&self) -> Metric {
        Metric::FutOpenInterest
    }

    fn step(&self) -> Duration {
        self.0.oi_step()
    }

    async fn fetch_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        self.0.fetch_and_store_open_interest(asset, start, end).await
    }

    async fn fill_gaps(&self, _asset: &str) -> Result<usize> {
        // History older than retention is simply absent, not a gap.
        Ok(0)
    }
}

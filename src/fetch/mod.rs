//! Data ingestion: provider adapters and per-metric fetchers.

pub mod backfill;
pub mod binance;
pub mod dune;
pub mod futures;
pub mod lending;
pub mod spot;

use crate::error::Result;
use crate::models::Metric;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Uniform ingestion contract for one fixed-cadence (asset, metric) stream.
///
/// The backfill manager and the gap-filling flows drive every metric through
/// this seam; the implementations own symbol mapping, pagination, and
/// raw-record normalization.
#[async_trait]
pub trait MetricIngest: Send + Sync {
    fn metric(&self) -> Metric;

    /// Native cadence of the metric's grid.
    fn step(&self) -> Duration;

    /// Fetch `[start, end]` from the provider and upsert into storage.
    /// Returns the number of newly stored rows.
    async fn fetch_range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize>;

    /// Detect and fill gaps; single-gap failures are logged and skipped.
    async fn fill_gaps(&self, asset: &str) -> Result<usize>;
}

//! Time-series alignment: concurrent multi-asset reads, daily resampling,
//! and a single aligned panel the risk engine consumes.

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::models::{ray_str_to_f64, Metric};
use crate::storage::Database;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// One column kind on the aligned day grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanelField {
    Spot,
    FuturesMark,
    Funding,
    LiquidityIndex,
    VariableBorrowIndex,
    SupplyRate,
    VariableBorrowRate,
    StableBorrowRate,
}

impl PanelField {
    /// Prices and indices forward-fill then backward-fill; rates fall back
    /// to zero (neutral) instead.
    fn zero_fills(&self) -> bool {
        matches!(
            self,
            PanelField::Funding
                | PanelField::SupplyRate
                | PanelField::VariableBorrowRate
                | PanelField::StableBorrowRate
        )
    }
}

/// Daily panel over the union of all asset timelines. Column presence is a
/// set: an asset with no source data for a field has no column at all, while
/// present columns are guaranteed fully filled.
#[derive(Debug, Default)]
pub struct AlignedPanel {
    days: Vec<DateTime<Utc>>,
    columns: HashMap<(String, PanelField), Vec<f64>>,
}

impl AlignedPanel {
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn days(&self) -> &[DateTime<Utc>] {
        &self.days
    }

    pub fn latest_day(&self) -> Option<DateTime<Utc>> {
        self.days.last().copied()
    }

    pub fn has_column(&self, asset: &str, field: PanelField) -> bool {
        self.columns.contains_key(&(asset.to_string(), field))
    }

    pub fn column(&self, asset: &str, field: PanelField) -> Option<&[f64]> {
        self.columns
            .get(&(asset.to_string(), field))
            .map(|v| v.as_slice())
    }

    pub fn value_at(&self, asset: &str, field: PanelField, row: usize) -> Option<f64> {
        self.column(asset, field).and_then(|col| col.get(row)).copied()
    }

    pub fn latest(&self, asset: &str, field: PanelField) -> Option<f64> {
        self.column(asset, field).and_then(|col| col.last()).copied()
    }

    /// Row index of the day closest to `at`, clamped to the grid.
    pub fn closest_row(&self, at: DateTime<Utc>) -> Option<usize> {
        if self.days.is_empty() {
            return None;
        }
        let mut best = 0usize;
        let mut best_diff = i64::MAX;
        for (i, day) in self.days.iter().enumerate() {
            let diff = (*day - at).num_seconds().abs();
            if diff < best_diff {
                best_diff = diff;
                best = i;
            }
        }
        Some(best)
    }
}

/// Raw per-asset reads before resampling. A failed read leaves the slot
/// `None` and degrades only that asset's columns.
#[derive(Default)]
struct RawAssetData {
    spot: Option<Vec<(DateTime<Utc>, f64)>>,
    mark: Option<Vec<(DateTime<Utc>, f64)>>,
    funding: Option<Vec<(DateTime<Utc>, f64)>>,
    lending: Option<Vec<(DateTime<Utc>, LendingSnapshot)>>,
}

#[derive(Debug, Clone, Copy)]
struct LendingSnapshot {
    supply_rate: f64,
    variable_borrow_rate: f64,
    stable_borrow_rate: f64,
    liquidity_index: f64,
    variable_borrow_index: f64,
}

/// Fetch, resample, and align everything the risk engine needs.
///
/// Returns the panel, accumulated fill warnings, and
/// `actual_days_available` (minimum day span across assets with data).
pub async fn fetch_aligned_panel(
    db: &Database,
    config: &Config,
    assets: &[String],
    lookback_days: i64,
) -> Result<(AlignedPanel, Vec<String>, i64)> {
    let end = Utc::now();
    let start = end - Duration::days(lookback_days);
    info!(
        "Fetching {lookback_days}d of data for {:?} ({} -> {})",
        assets,
        start.date_naive(),
        end.date_naive()
    );

    // One blocking read task per asset; reads see independent snapshots.
    let tasks = assets.iter().map(|asset| {
        let db = db.clone();
        let asset = asset.clone();
        let lending_asset = config.lending_symbol(&asset);
        tokio::task::spawn_blocking(move || (asset.clone(), read_asset(&db, &asset, &lending_asset, start, end)))
    });

    let mut raw: HashMap<String, RawAssetData> = HashMap::new();
    for joined in join_all(tasks).await {
        match joined {
            Ok((asset, data)) => {
                raw.insert(asset, data);
            }
            Err(e) => warn!("Asset read task panicked: {e}"),
        }
    }

    // Minimum day span across assets with spot history.
    let mut actual_days = lookback_days;
    for (asset, data) in &raw {
        if let Some(spot) = &data.spot {
            if let (Some(first), Some(last)) = (spot.first(), spot.last()) {
                let span = (last.0 - first.0).num_days();
                if span < actual_days {
                    actual_days = span;
                }
                debug!("{asset}: {} spot rows spanning {span}d", spot.len());
            }
        }
    }

    let (panel, warnings) = align(raw)?;
    info!(
        "Aligned panel: {} days x {} columns, {} warnings",
        panel.len(),
        panel.columns.len(),
        warnings.len()
    );

    Ok((panel, warnings, actual_days))
}

fn read_asset(
    db: &Database,
    asset: &str,
    lending_asset: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> RawAssetData {
    let mut data = RawAssetData::default();

    match db.get_ohlcv(asset, Some(start), Some(end), None) {
        Ok(rows) if !rows.is_empty() => {
            data.spot = Some(rows.into_iter().map(|c| (c.timestamp, c.close)).collect());
        }
        Ok(_) => debug!("No spot data available for {asset}"),
        Err(e) => warn!("Failed to fetch spot data for {asset}: {e}"),
    }

    match db.get_klines(Metric::FutMarkKlines, asset, Some(start), Some(end), None) {
        Ok(rows) if !rows.is_empty() => {
            data.mark = Some(rows.into_iter().map(|k| (k.timestamp, k.close)).collect());
        }
        Ok(_) => debug!("No mark price data available for {asset}"),
        Err(e) => warn!("Failed to fetch mark klines for {asset}: {e}"),
    }

    match db.get_funding_rates(asset, Some(start), Some(end), None) {
        Ok(rows) if !rows.is_empty() => {
            data.funding = Some(
                rows.into_iter()
                    .map(|r| (r.timestamp, r.funding_rate))
                    .collect(),
            );
        }
        Ok(_) => debug!("No funding data available for {asset}"),
        Err(e) => warn!("Failed to fetch funding rates for {asset}: {e}"),
    }

    match db.get_lending(lending_asset, Some(start), Some(end), None) {
        Ok(rows) if !rows.is_empty() => {
            let parsed: Vec<(DateTime<Utc>, LendingSnapshot)> = rows
                .into_iter()
                .filter_map(|r| {
                    Some((
                        r.timestamp,
                        LendingSnapshot {
                            supply_rate: ray_str_to_f64(&r.supply_rate_ray)?,
                            variable_borrow_rate: ray_str_to_f64(&r.var_borrow_rate_ray)?,
                            stable_borrow_rate: ray_str_to_f64(&r.stable_borrow_rate_ray)
                                .unwrap_or(0.0),
                            liquidity_index: ray_str_to_f64(&r.liquidity_index)?,
                            variable_borrow_index: ray_str_to_f64(&r.variable_borrow_index)?,
                        },
                    ))
                })
                .collect();
            if !parsed.is_empty() {
                data.lending = Some(parsed);
            }
        }
        Ok(_) => debug!("No lending data available for {asset}"),
        Err(e) => warn!("Failed to fetch lending data for {asset}: {e}"),
    }

    data
}

fn day_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(ts)
}

/// Resample to daily buckets: last observation of the day.
fn daily_last(rows: &[(DateTime<Utc>, f64)]) -> BTreeMap<DateTime<Utc>, f64> {
    let mut daily = BTreeMap::new();
    for (ts, v) in rows {
        daily.insert(day_floor(*ts), *v);
    }
    daily
}

/// Resample to daily buckets: mean of the day (funding is a rate).
fn daily_mean(rows: &[(DateTime<Utc>, f64)]) -> BTreeMap<DateTime<Utc>, f64> {
    let mut sums: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
    for (ts, v) in rows {
        let entry = sums.entry(day_floor(*ts)).or_insert((0.0, 0));
        entry.0 += v;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(day, (sum, n))| (day, sum / n as f64))
        .collect()
}

fn align(raw: HashMap<String, RawAssetData>) -> Result<(AlignedPanel, Vec<String>)> {
    // Per-(asset, field) daily series.
    let mut daily: HashMap<(String, PanelField), BTreeMap<DateTime<Utc>, f64>> = HashMap::new();

    for (asset, data) in &raw {
        if let Some(spot) = &data.spot {
            daily.insert((asset.clone(), PanelField::Spot), daily_last(spot));
        }
        // Futures columns exist only when mark prices exist; funding joins
        // onto the mark timeline with 0 as the neutral default.
        if let Some(mark) = &data.mark {
            daily.insert((asset.clone(), PanelField::FuturesMark), daily_last(mark));
            let funding = data
                .funding
                .as_ref()
                .map(|f| daily_mean(f))
                .unwrap_or_default();
            daily.insert((asset.clone(), PanelField::Funding), funding);
        }
        if let Some(lending) = &data.lending {
            let pick = |f: fn(&LendingSnapshot) -> f64| {
                daily_last(
                    &lending
                        .iter()
                        .map(|(ts, snap)| (*ts, f(snap)))
                        .collect::<Vec<_>>(),
                )
            };
            daily.insert(
                (asset.clone(), PanelField::LiquidityIndex),
                pick(|s| s.liquidity_index),
            );
            daily.insert(
                (asset.clone(), PanelField::VariableBorrowIndex),
                pick(|s| s.variable_borrow_index),
            );
            daily.insert(
                (asset.clone(), PanelField::SupplyRate),
                pick(|s| s.supply_rate),
            );
            daily.insert(
                (asset.clone(), PanelField::VariableBorrowRate),
                pick(|s| s.variable_borrow_rate),
            );
            daily.insert(
                (asset.clone(), PanelField::StableBorrowRate),
                pick(|s| s.stable_borrow_rate),
            );
        }
    }

    // Union timeline: continuous daily grid from the earliest to the latest
    // observed day.
    let min_day = daily.values().filter_map(|s| s.keys().next()).min().copied();
    let max_day = daily
        .values()
        .filter_map(|s| s.keys().next_back())
        .max()
        .copied();
    let (Some(min_day), Some(max_day)) = (min_day, max_day) else {
        return Err(ServiceError::Validation(
            "no historical data available for any requested asset".into(),
        ));
    };

    let mut days = Vec::new();
    let mut d = min_day;
    while d <= max_day {
        days.push(d);
        d += Duration::days(1);
    }

    let mut panel = AlignedPanel {
        days: days.clone(),
        columns: HashMap::new(),
    };
    let mut warnings = Vec::new();

    for ((asset, field), series) in daily {
        let mut column: Vec<Option<f64>> = days.iter().map(|d| series.get(d).copied()).collect();

        // Forward fill.
        let mut last = None;
        for slot in column.iter_mut() {
            match slot {
                Some(v) => last = Some(*v),
                None => *slot = last,
            }
        }

        let missing = column.iter().filter(|v| v.is_none()).count();
        if missing > 0 {
            match field {
                PanelField::Spot => warnings.push(format!(
                    "{asset} spot: {missing} missing values at the beginning (no forward-fill source)"
                )),
                PanelField::FuturesMark => {
                    warnings.push(format!("{asset} futures: {missing} missing mark prices"))
                }
                PanelField::Funding => {
                    warnings.push(format!("{asset} funding: {missing} missing funding rates"))
                }
                PanelField::LiquidityIndex => warnings.push(format!(
                    "{asset} lending: {missing} missing liquidity indices"
                )),
                PanelField::VariableBorrowIndex => warnings.push(format!(
                    "{asset} lending: {missing} missing variable borrow indices"
                )),
                _ => {}
            }
        }

        let filled: Vec<f64> = if field.zero_fills() {
            column.into_iter().map(|v| v.unwrap_or(0.0)).collect()
        } else {
            // Backward fill leading gaps from the first observation.
            let first = column.iter().flatten().next().copied().unwrap_or(0.0);
            column.into_iter().map(|v| v.unwrap_or(first)).collect()
        };

        panel.columns.insert((asset, field), filled);
    }

    for warning in &warnings {
        warn!("Data gap: {warning}");
    }

    Ok((panel, warnings))
}

//! `/api/v1` handlers: market-data reads, aggregated stats, risk profile,
//! and the authenticated fetch trigger.

use crate::analysis::aggregated::{
    calculate_cross_asset_correlations, calculate_futures_stats, calculate_lending_stats,
    calculate_spot_stats, FuturesStats, LendingStats, SpotStats,
};
use crate::analysis::metrics::CorrelationMatrix;
use crate::analysis::riskprofile::{calculate_risk_profile, RiskProfileRequest, RiskProfileResponse};
use crate::api::AppState;
use crate::error::{Result, ServiceError};
use crate::models::{
    ray_str_to_f64, ray_to_apy_pct, FundingRateRow, FuturesKline, Metric, OhlcvCandle,
    OpenInterestRow,
};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info};
use uuid::Uuid;

const MAX_SERIES_LIMIT: usize = 10_000;
const MAX_LENDING_LIMIT: usize = 1_000;
const MAX_STATS_WINDOW_DAYS: i64 = 90;
const MAX_MULTI_ASSETS: usize = 10;

// ==================== common query shapes ====================

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub fill: Option<bool>,
}

impl RangeQuery {
    fn validate_window(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(ServiceError::Validation(
                    "end must not be earlier than start".into(),
                ));
            }
        }
        Ok(())
    }

    fn capped_limit(&self, cap: usize) -> Result<Option<usize>> {
        match self.limit {
            Some(0) => Err(ServiceError::Validation("limit must be positive".into())),
            Some(n) if n > cap => Err(ServiceError::Validation(format!(
                "limit must not exceed {cap}"
            ))),
            other => Ok(other),
        }
    }
}

// ==================== service info & health ====================

#[derive(Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    pub tracked_spot_assets: Vec<String>,
    pub tracked_futures_assets: Vec<String>,
    pub tracked_lending_assets: Vec<String>,
    pub api: &'static str,
}

pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "Crypto Portfolio Risk Service",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        tracked_spot_assets: state.config.tracked_assets.clone(),
        tracked_futures_assets: state.config.tracked_futures_assets.clone(),
        tracked_lending_assets: state.config.tracked_lending_assets.clone(),
        api: "/api/v1",
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Always 200; `status` flips when the database is unreachable.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = state.db.health_check();
    Json(HealthResponse {
        status: if db_ok { "healthy" } else { "degraded" },
        database: if db_ok { "connected" } else { "disconnected" },
        timestamp: Utc::now(),
    })
}

// ==================== coverage listings ====================

#[derive(Serialize)]
pub struct AssetCoverage {
    pub asset: String,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub total_candles: i64,
    pub backfill_completed: bool,
}

pub async fn spot_assets(State(state): State<AppState>) -> Result<Json<Vec<AssetCoverage>>> {
    let mut out = Vec::new();
    for asset in &state.config.tracked_assets {
        out.push(AssetCoverage {
            asset: asset.clone(),
            earliest_timestamp: state.db.earliest_timestamp(Metric::SpotOhlcv, asset)?,
            latest_timestamp: state.db.latest_timestamp(Metric::SpotOhlcv, asset)?,
            total_candles: state.db.row_count(Metric::SpotOhlcv, asset)?,
            backfill_completed: state.db.is_backfill_completed(asset, Metric::SpotOhlcv)?,
        });
    }
    Ok(Json(out))
}

#[derive(Serialize)]
pub struct FuturesAssetCoverage {
    pub asset: String,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub funding_count: i64,
    pub mark_klines_count: i64,
    pub open_interest_count: i64,
    pub backfill_completed: bool,
}

pub async fn futures_assets(
    State(state): State<AppState>,
) -> Result<Json<Vec<FuturesAssetCoverage>>> {
    let mut out = Vec::new();
    for asset in &state.config.tracked_futures_assets {
        out.push(FuturesAssetCoverage {
            asset: asset.clone(),
            earliest_timestamp: state.db.earliest_timestamp(Metric::FutFunding, asset)?,
            latest_timestamp: state.db.latest_timestamp(Metric::FutFunding, asset)?,
            funding_count: state.db.row_count(Metric::FutFunding, asset)?,
            mark_klines_count: state.db.row_count(Metric::FutMarkKlines, asset)?,
            open_interest_count: state.db.row_count(Metric::FutOpenInterest, asset)?,
            backfill_completed: state.db.is_backfill_completed(asset, Metric::FutFunding)?,
        });
    }
    Ok(Json(out))
}

#[derive(Serialize)]
pub struct LendingAssetCoverage {
    pub asset: String,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub total_snapshots: i64,
    pub backfill_completed: bool,
}

pub async fn lending_assets(
    State(state): State<AppState>,
) -> Result<Json<Vec<LendingAssetCoverage>>> {
    let mut out = Vec::new();
    for asset in &state.config.tracked_lending_assets {
        out.push(LendingAssetCoverage {
            asset: asset.clone(),
            earliest_timestamp: state.db.earliest_timestamp(Metric::Lending, asset)?,
            latest_timestamp: state.db.latest_timestamp(Metric::Lending, asset)?,
            total_snapshots: state.db.row_count(Metric::Lending, asset)?,
            backfill_completed: state.db.is_backfill_completed(asset, Metric::Lending)?,
        });
    }
    Ok(Json(out))
}

// ==================== spot candles ====================

#[derive(Serialize)]
pub struct OhlcvResponse {
    pub asset: String,
    pub interval: &'static str,
    pub data: Vec<OhlcvCandle>,
    pub count: usize,
}

pub async fn ohlcv(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<OhlcvResponse>> {
    let asset = asset.to_uppercase();
    if !state.config.is_tracked_spot(&asset) {
        return Err(ServiceError::NotFound(format!("asset not tracked: {asset}")));
    }
    query.validate_window()?;
    let limit = query.capped_limit(MAX_SERIES_LIMIT)?;

    let mut data = state.db.get_ohlcv(&asset, query.start, query.end, limit)?;
    if query.fill.unwrap_or(false) {
        data = forward_fill_candles(data);
    }

    Ok(Json(OhlcvResponse {
        asset,
        interval: "12h",
        count: data.len(),
        data,
    }))
}

/// Forward-fill the 12h grid; synthetic candles flatline at the previous
/// close and are marked `filled`.
fn forward_fill_candles(candles: Vec<OhlcvCandle>) -> Vec<OhlcvCandle> {
    let step = Duration::hours(12);
    let mut out: Vec<OhlcvCandle> = Vec::with_capacity(candles.len());

    for candle in candles {
        if let Some(prev) = out.last().cloned() {
            let mut expected = prev.timestamp + step;
            while expected < candle.timestamp {
                out.push(OhlcvCandle {
                    timestamp: expected,
                    open: prev.close,
                    high: prev.close,
                    low: prev.close,
                    close: prev.close,
                    volume: 0.0,
                    filled: true,
                });
                expected += step;
            }
        }
        out.push(candle);
    }
    out
}

// ==================== futures series ====================

#[derive(Serialize)]
pub struct FundingRateResponse {
    pub asset: String,
    pub data: Vec<FundingRateRow>,
    pub count: usize,
}

pub async fn funding_rates(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<FundingRateResponse>> {
    let asset = futures_asset(&state, &asset)?;
    query.validate_window()?;
    let limit = query.capped_limit(MAX_SERIES_LIMIT)?;

    let data = state
        .db
        .get_funding_rates(&asset, query.start, query.end, limit)?;
    if data.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "no funding rate data for {asset}"
        )));
    }
    Ok(Json(FundingRateResponse {
        asset,
        count: data.len(),
        data,
    }))
}

#[derive(Serialize)]
pub struct KlinesResponse {
    pub asset: String,
    pub interval: String,
    pub data: Vec<FuturesKline>,
    pub count: usize,
}

pub async fn mark_price(
    state: State<AppState>,
    path: Path<String>,
    query: Query<RangeQuery>,
) -> Result<Json<KlinesResponse>> {
    klines_response(state, path, query, Metric::FutMarkKlines).await
}

pub async fn index_price(
    state: State<AppState>,
    path: Path<String>,
    query: Query<RangeQuery>,
) -> Result<Json<KlinesResponse>> {
    klines_response(state, path, query, Metric::FutIndexKlines).await
}

async fn klines_response(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<RangeQuery>,
    metric: Metric,
) -> Result<Json<KlinesResponse>> {
    let asset = futures_asset(&state, &asset)?;
    query.validate_window()?;
    let limit = query.capped_limit(MAX_SERIES_LIMIT)?;

    let data = state
        .db
        .get_klines(metric, &asset, query.start, query.end, limit)?;
    if data.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "no {} data for {asset}",
            metric.as_str()
        )));
    }
    Ok(Json(KlinesResponse {
        asset,
        interval: state.config.futures_klines_interval.clone(),
        count: data.len(),
        data,
    }))
}

#[derive(Serialize)]
pub struct OpenInterestResponse {
    pub asset: String,
    pub period: String,
    pub data: Vec<OpenInterestRow>,
    pub count: usize,
}

pub async fn open_interest(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<OpenInterestResponse>> {
    let asset = futures_asset(&state, &asset)?;
    query.validate_window()?;
    let limit = query.capped_limit(MAX_SERIES_LIMIT)?;

    let data = state
        .db
        .get_open_interest(&asset, query.start, query.end, limit)?;
    if data.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "no open interest data for {asset}"
        )));
    }
    Ok(Json(OpenInterestResponse {
        asset,
        period: state.config.futures_oi_period.clone(),
        count: data.len(),
        data,
    }))
}

fn futures_asset(state: &AppState, asset: &str) -> Result<String> {
    let asset = asset.to_uppercase();
    if !state.config.is_tracked_futures(&asset) {
        return Err(ServiceError::NotFound(format!(
            "futures asset not tracked: {asset}"
        )));
    }
    Ok(asset)
}

// ==================== lending series ====================

#[derive(Serialize)]
pub struct LendingPoint {
    pub timestamp: DateTime<Utc>,
    pub supply_rate_ray: String,
    pub var_borrow_rate_ray: String,
    pub stable_borrow_rate_ray: String,
    pub liquidity_index: String,
    pub variable_borrow_index: String,
    pub supply_apy_pct: Option<f64>,
    pub variable_borrow_apy_pct: Option<f64>,
    pub stable_borrow_apy_pct: Option<f64>,
}

#[derive(Serialize)]
pub struct LendingResponse {
    pub asset: String,
    pub data: Vec<LendingPoint>,
    pub count: usize,
}

pub async fn lending(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<LendingResponse>> {
    // BTC/ETH alias onto the wrapped reserve symbols.
    let mapped = state.config.lending_symbol(&asset);
    if !state.config.is_tracked_lending(&mapped) {
        return Err(ServiceError::NotFound(format!(
            "lending asset not tracked: {asset}"
        )));
    }
    query.validate_window()?;
    let limit = query.capped_limit(MAX_LENDING_LIMIT)?;

    let rows = state
        .db
        .get_lending(&mapped, query.start, query.end, limit)?;
    if rows.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "no lending data for {mapped}"
        )));
    }

    let data: Vec<LendingPoint> = rows
        .into_iter()
        .map(|r| LendingPoint {
            supply_apy_pct: ray_str_to_f64(&r.supply_rate_ray).map(ray_to_apy_pct),
            variable_borrow_apy_pct: ray_str_to_f64(&r.var_borrow_rate_ray).map(ray_to_apy_pct),
            stable_borrow_apy_pct: ray_str_to_f64(&r.stable_borrow_rate_ray).map(ray_to_apy_pct),
            timestamp: r.timestamp,
            supply_rate_ray: r.supply_rate_ray,
            var_borrow_rate_ray: r.var_borrow_rate_ray,
            stable_borrow_rate_ray: r.stable_borrow_rate_ray,
            liquidity_index: r.liquidity_index,
            variable_borrow_index: r.variable_borrow_index,
        })
        .collect();

    Ok(Json(LendingResponse {
        asset: mapped,
        count: data.len(),
        data,
    }))
}

// ==================== aggregated stats ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Spot,
    Futures,
    Lending,
}

fn parse_data_types(raw: Option<&str>) -> Result<Vec<DataType>> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(vec![DataType::Spot, DataType::Futures, DataType::Lending]);
    };
    let mut types = Vec::new();
    for part in raw.split(',') {
        let t = match part.trim().to_lowercase().as_str() {
            "spot" => DataType::Spot,
            "futures" => DataType::Futures,
            "lending" => DataType::Lending,
            other => {
                return Err(ServiceError::Validation(format!(
                    "invalid data_type: {other} (expected spot, futures, lending)"
                )))
            }
        };
        if !types.contains(&t) {
            types.push(t);
        }
    }
    Ok(types)
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub data_types: Option<String>,
    /// Comma-separated list, multi endpoint only.
    pub assets: Option<String>,
}

impl StatsQuery {
    fn window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self.start.unwrap_or(end - Duration::days(30));
        if end < start {
            return Err(ServiceError::Validation(
                "end must not be earlier than start".into(),
            ));
        }
        if end - start > Duration::days(MAX_STATS_WINDOW_DAYS) {
            return Err(ServiceError::Validation(format!(
                "window must not exceed {MAX_STATS_WINDOW_DAYS} days"
            )));
        }
        Ok((start, end))
    }
}

#[derive(Serialize)]
pub struct AggregatedStatsResponse {
    pub asset: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub spot: Option<SpotStats>,
    pub futures: Option<FuturesStats>,
    pub lending: Option<LendingStats>,
}

pub async fn aggregated_stats_single(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<AggregatedStatsResponse>> {
    let asset = asset.to_uppercase();
    let (start, end) = query.window()?;
    let data_types = parse_data_types(query.data_types.as_deref())?;
    validate_stats_asset(&state, &asset)?;

    let response = compose_asset_stats(&state, &asset, start, end, &data_types)?;
    Ok(Json(response))
}

#[derive(Serialize)]
pub struct MultiAssetStatsResponse {
    pub assets: BTreeMap<String, AggregatedStatsResponse>,
    pub correlation_matrix: Option<CorrelationMatrix>,
}

pub async fn aggregated_stats_multi(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<MultiAssetStatsResponse>> {
    let raw_assets = query.assets.clone().unwrap_or_default();
    let assets: Vec<String> = raw_assets
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if assets.is_empty() {
        return Err(ServiceError::Validation("assets parameter required".into()));
    }
    if assets.len() > MAX_MULTI_ASSETS {
        return Err(ServiceError::Validation(format!(
            "at most {MAX_MULTI_ASSETS} assets per request"
        )));
    }

    let (start, end) = query.window()?;
    let data_types = parse_data_types(query.data_types.as_deref())?;

    let mut blocks = BTreeMap::new();
    let mut spot_series = std::collections::HashMap::new();
    for asset in &assets {
        validate_stats_asset(&state, asset)?;
        let block = compose_asset_stats(&state, asset, start, end, &data_types)?;
        if data_types.contains(&DataType::Spot) {
            let candles = state.db.get_ohlcv(asset, Some(start), Some(end), None)?;
            if candles.len() >= 2 {
                spot_series.insert(asset.clone(), candles);
            }
        }
        blocks.insert(asset.clone(), block);
    }

    let correlation_matrix = if spot_series.len() >= 2 {
        calculate_cross_asset_correlations(&spot_series)
    } else {
        None
    };

    Ok(Json(MultiAssetStatsResponse {
        assets: blocks,
        correlation_matrix,
    }))
}

fn validate_stats_asset(state: &AppState, asset: &str) -> Result<()> {
    let tracked = state.config.is_tracked_spot(asset)
        || state.config.is_tracked_futures(asset)
        || state.config.is_tracked_lending(asset);
    if !tracked {
        return Err(ServiceError::NotFound(format!("asset not tracked: {asset}")));
    }
    Ok(())
}

fn compose_asset_stats(
    state: &AppState,
    asset: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    data_types: &[DataType],
) -> Result<AggregatedStatsResponse> {
    let spot_candles = state.db.get_ohlcv(asset, Some(start), Some(end), None)?;
    let current_spot = spot_candles.last().map(|c| c.close);

    let spot = if data_types.contains(&DataType::Spot) {
        calculate_spot_stats(&spot_candles, state.config.risk_free_rate)
    } else {
        None
    };

    let futures = if data_types.contains(&DataType::Futures) {
        let funding = state
            .db
            .get_funding_rates(asset, Some(start), Some(end), None)?;
        let mark = state
            .db
            .get_klines(Metric::FutMarkKlines, asset, Some(start), Some(end), None)?;
        let oi = state
            .db
            .get_open_interest(asset, Some(start), Some(end), None)?;
        calculate_futures_stats(&funding, &mark, &oi, current_spot)
    } else {
        None
    };

    let lending = if data_types.contains(&DataType::Lending) {
        let mapped = state.config.lending_symbol(asset);
        let rows = state.db.get_lending(&mapped, Some(start), Some(end), None)?;
        calculate_lending_stats(&rows)
    } else {
        None
    };

    Ok(AggregatedStatsResponse {
        asset: asset.to_string(),
        start_date: start,
        end_date: end,
        spot,
        futures,
        lending,
    })
}

// ==================== risk profile ====================

pub async fn risk_profile(
    State(state): State<AppState>,
    Json(request): Json<RiskProfileRequest>,
) -> Result<Json<RiskProfileResponse>> {
    let response = calculate_risk_profile(&state.db, &state.config, request).await?;
    Ok(Json(response))
}

// ==================== fetch trigger ====================

#[derive(Debug, Deserialize)]
pub struct FetchTriggerRequest {
    pub assets: Option<Vec<String>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct FetchTriggerResponse {
    pub job_id: String,
    pub message: String,
    pub assets: Vec<String>,
}

/// Kick off a background fetch for the requested assets. Requires the
/// static X-API-KEY.
pub async fn fetch_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FetchTriggerRequest>,
) -> Result<Json<FetchTriggerResponse>> {
    let provided = headers
        .get("X-API-KEY")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != state.config.api_key {
        return Err(ServiceError::Unauthorized(
            "invalid or missing API key".into(),
        ));
    }

    let assets: Vec<String> = match request.assets {
        Some(list) => {
            let normalized: Vec<String> =
                list.iter().map(|a| a.trim().to_uppercase()).collect();
            for asset in &normalized {
                if !state.config.is_tracked_spot(asset) {
                    return Err(ServiceError::NotFound(format!(
                        "asset not tracked: {asset}"
                    )));
                }
            }
            normalized
        }
        None => state.config.tracked_assets.clone(),
    };

    let end = request.end_date.unwrap_or_else(Utc::now);
    let start = request
        .start_date
        .unwrap_or(end - Duration::days(state.config.min_backfill_days));
    if end < start {
        return Err(ServiceError::Validation(
            "end_date must not be earlier than start_date".into(),
        ));
    }

    let job_id = Uuid::new_v4().to_string();
    let spot = state.spot.clone();
    let job_assets = assets.clone();
    let job = job_id.clone();
    tokio::spawn(async move {
        info!("Fetch job {job} started for {job_assets:?}");
        for asset in &job_assets {
            match spot.fetch_and_store_range(asset, start, end).await {
                Ok(n) => info!("Fetch job {job}: {asset} stored {n} candles"),
                Err(e) => {
                    error!("Fetch job {job}: {asset} failed: {e}");
                    continue;
                }
            }
            if let Err(e) = spot.fill_gaps(asset).await {
                error!("Fetch job {job}: gap fill for {asset} failed: {e}");
            }
        }
        info!("Fetch job {job} finished");
    });

    Ok(Json(FetchTriggerResponse {
        job_id,
        message: format!(
            "fetch started for {} asset(s) from {} to {}",
            assets.len(),
            start.date_naive(),
            end.date_naive()
        ),
        assets,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn data_types_parse_and_reject() {
        let all = parse_data_types(None).unwrap();
        assert_eq!(all.len(), 3);

        let some = parse_data_types(Some("spot, lending")).unwrap();
        assert_eq!(some, vec![DataType::Spot, DataType::Lending]);

        assert!(parse_data_types(Some("spot,bogus")).is_err());
    }

    #[test]
    fn stats_window_bounds() {
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let q = |start_days: i64| StatsQuery {
            start: Some(end - Duration::days(start_days)),
            end: Some(end),
            data_types: None,
            assets: None,
        };
        assert!(q(90).window().is_ok());
        assert!(q(91).window().is_err());

        let backwards = StatsQuery {
            start: Some(end),
            end: Some(end - Duration::days(1)),
            data_types: None,
            assets: None,
        };
        assert!(backwards.window().is_err());
    }

    #[test]
    fn forward_fill_marks_synthetic_candles() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mk = |h: i64, close: f64| OhlcvCandle {
            timestamp: t0 + Duration::hours(h),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            filled: false,
        };
        // Grid point at +12h missing.
        let filled = forward_fill_candles(vec![mk(0, 100.0), mk(24, 120.0)]);
        assert_eq!(filled.len(), 3);
        assert!(filled[1].filled);
        assert_eq!(filled[1].close, 100.0);
        assert_eq!(filled[1].volume, 0.0);
        assert!(!filled[2].filled);
    }
}

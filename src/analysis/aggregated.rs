//! Aggregated per-asset statistics and cross-asset correlation for the
//! stats endpoints. Insufficient input yields `None` for a block, never an
//! error.

use crate::analysis::metrics::{
    calculate_correlation_matrix, calculate_max_drawdown, calculate_returns,
    calculate_sharpe_ratio, calculate_volatility, CorrelationMatrix,
};
use crate::models::{
    ray_str_to_f64, ray_to_apy_pct, FundingRateRow, FuturesKline, LendingRow, OhlcvCandle,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Alias so callers can pass stored rows without a conversion dance.
pub use crate::models::OpenInterestRow as OpenInterestPoint;
use statrs::statistics::Statistics;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct SpotStats {
    pub current_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub mean_price: f64,
    pub total_return_pct: f64,
    pub volatility_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FuturesStats {
    pub current_funding_rate_pct: f64,
    pub mean_funding_rate_pct: f64,
    pub cumulative_funding_cost_pct: f64,
    pub current_basis_premium_pct: Option<f64>,
    pub mean_basis_premium_pct: Option<f64>,
    pub current_open_interest: Option<f64>,
    pub open_interest_change_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LendingStats {
    pub current_supply_apy_pct: f64,
    pub mean_supply_apy_pct: f64,
    pub min_supply_apy_pct: f64,
    pub max_supply_apy_pct: f64,
    pub current_variable_borrow_apy_pct: f64,
    pub mean_variable_borrow_apy_pct: f64,
    pub spread_pct: f64,
}

/// Price and return statistics over a stored candle range.
pub fn calculate_spot_stats(candles: &[OhlcvCandle], risk_free_rate: f64) -> Option<SpotStats> {
    if candles.len() < 2 {
        debug!("Insufficient spot data for stats (need >= 2 points)");
        return None;
    }

    let prices: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let returns = calculate_returns(&prices);
    if returns.is_empty() {
        return None;
    }

    Some(SpotStats {
        current_price: prices[prices.len() - 1],
        min_price: prices.iter().copied().fold(f64::INFINITY, f64::min),
        max_price: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean_price: prices.as_slice().mean(),
        total_return_pct: (prices[prices.len() - 1] / prices[0] - 1.0) * 100.0,
        volatility_pct: calculate_volatility(&returns, true) * 100.0,
        sharpe_ratio: calculate_sharpe_ratio(&returns, risk_free_rate),
        max_drawdown_pct: calculate_max_drawdown(&prices) * 100.0,
    })
}

/// Funding, basis, and open-interest statistics. Basis needs mark klines and
/// a current spot close; OI needs at least two points. Missing inputs leave
/// those sub-metrics `None`.
pub fn calculate_futures_stats(
    funding: &[FundingRateRow],
    mark: &[FuturesKline],
    open_interest: &[OpenInterestPoint],
    spot_price: Option<f64>,
) -> Option<FuturesStats> {
    if funding.is_empty() {
        debug!("No funding data available");
        return None;
    }

    let rates: Vec<f64> = funding.iter().map(|r| r.funding_rate).collect();
    let current_funding_rate_pct = rates[rates.len() - 1] * 100.0;
    let mean_funding_rate_pct = rates.as_slice().mean() * 100.0;
    let cumulative_funding_cost_pct = rates.iter().sum::<f64>() * 100.0;

    let mut current_basis_premium_pct = None;
    let mut mean_basis_premium_pct = None;
    if let Some(spot) = spot_price.filter(|p| *p > 0.0) {
        if !mark.is_empty() {
            let marks: Vec<f64> = mark.iter().map(|k| k.close).collect();
            current_basis_premium_pct =
                Some((marks[marks.len() - 1] - spot) / spot * 100.0);
            let premiums: Vec<f64> = marks.iter().map(|m| (m - spot) / spot * 100.0).collect();
            mean_basis_premium_pct = Some(premiums.as_slice().mean());
        }
    }

    let mut current_open_interest = None;
    let mut open_interest_change_pct = None;
    if open_interest.len() >= 2 {
        let first = open_interest[0].open_interest;
        let last = open_interest[open_interest.len() - 1].open_interest;
        current_open_interest = Some(last);
        if first > 0.0 {
            open_interest_change_pct = Some((last / first - 1.0) * 100.0);
        }
    }

    Some(FuturesStats {
        current_funding_rate_pct,
        mean_funding_rate_pct,
        cumulative_funding_cost_pct,
        current_basis_premium_pct,
        mean_basis_premium_pct,
        current_open_interest,
        open_interest_change_pct,
    })
}

/// Supply/borrow APY statistics over stored RAY snapshots.
pub fn calculate_lending_stats(rows: &[LendingRow]) -> Option<LendingStats> {
    if rows.is_empty() {
        debug!("No lending data available");
        return None;
    }

    let mut supply_apys = Vec::with_capacity(rows.len());
    let mut borrow_apys = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(supply), Some(borrow)) = (
            ray_str_to_f64(&row.supply_rate_ray),
            ray_str_to_f64(&row.var_borrow_rate_ray),
        ) else {
            debug!("Skipping lending row with unparseable RAY values");
            continue;
        };
        supply_apys.push(ray_to_apy_pct(supply));
        borrow_apys.push(ray_to_apy_pct(borrow));
    }

    if supply_apys.is_empty() || borrow_apys.is_empty() {
        return None;
    }

    let current_supply = supply_apys[supply_apys.len() - 1];
    let current_borrow = borrow_apys[borrow_apys.len() - 1];

    Some(LendingStats {
        current_supply_apy_pct: current_supply,
        mean_supply_apy_pct: supply_apys.as_slice().mean(),
        min_supply_apy_pct: supply_apys.iter().copied().fold(f64::INFINITY, f64::min),
        max_supply_apy_pct: supply_apys.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        current_variable_borrow_apy_pct: current_borrow,
        mean_variable_borrow_apy_pct: borrow_apys.as_slice().mean(),
        spread_pct: current_borrow - current_supply,
    })
}

/// Cross-asset Pearson correlation over daily closes, inner-joined on
/// timestamp. Needs at least 2 assets with 2 overlapping points.
pub fn calculate_cross_asset_correlations(
    multi_asset_candles: &HashMap<String, Vec<OhlcvCandle>>,
) -> Option<CorrelationMatrix> {
    if multi_asset_candles.len() < 2 {
        debug!("Need at least 2 assets for correlation");
        return None;
    }

    // Index closes by timestamp per asset.
    let mut by_asset: HashMap<&String, HashMap<DateTime<Utc>, f64>> = HashMap::new();
    for (asset, candles) in multi_asset_candles {
        if candles.len() < 2 {
            debug!("Skipping {asset}: insufficient data for correlation");
            continue;
        }
        by_asset.insert(asset, candles.iter().map(|c| (c.timestamp, c.close)).collect());
    }
    if by_asset.len() < 2 {
        return None;
    }

    // Inner join: timestamps present for every asset.
    let mut overlap: Vec<DateTime<Utc>> = by_asset
        .values()
        .next()?
        .keys()
        .filter(|ts| by_asset.values().all(|m| m.contains_key(ts)))
        .copied()
        .collect();
    overlap.sort();

    if overlap.len() < 2 {
        debug!("Insufficient overlapping data points for correlation");
        return None;
    }

    let mut multi_asset_returns: HashMap<String, Vec<f64>> = HashMap::new();
    for (asset, closes) in &by_asset {
        let prices: Vec<f64> = overlap.iter().map(|ts| closes[ts]).collect();
        let returns = calculate_returns(&prices);
        if !returns.is_empty() {
            multi_asset_returns.insert((*asset).clone(), returns);
        }
    }
    if multi_asset_returns.len() < 2 {
        return None;
    }

    Some(calculate_correlation_matrix(&multi_asset_returns))
}

//! Portfolio risk profile: validation, historical simulation, sensitivity,
//! scenarios, and account-level lending metrics.

use crate::analysis::data_service::{fetch_aligned_panel, AlignedPanel, PanelField};
use crate::analysis::metrics::{
    calculate_correlation_matrix, calculate_cvar, calculate_max_drawdown, calculate_net_apy,
    calculate_portfolio_variance, calculate_returns, calculate_sharpe_ratio,
    calculate_var_historical, calculate_volatility, quantile, CorrelationMatrix, CurrentRates,
};
use crate::analysis::scenarios::{run_all_scenarios, ScenarioResult};
use crate::analysis::valuation::{
    account_ltv, delta_exposure, health_factor, portfolio_value, position_value,
    sensitivity_table, AssetIndices, IndexMap, PriceMap, SensitivityPoint,
};
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::models::{Position, PositionType};
use crate::storage::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

pub const MIN_LOOKBACK_DAYS: i64 = 7;
/// Below this span the historical sample is too thin to trust.
const RELIABLE_DAYS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct RiskProfileRequest {
    pub positions: Vec<Position>,
    #[serde(default)]
    pub lookback_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LendingMetrics {
    pub total_supplied_value: f64,
    pub total_borrowed_value: f64,
    pub net_lending_value: f64,
    pub current_ltv: f64,
    /// `null` means no debt: the health factor is infinite.
    pub health_factor: Option<f64>,
    pub max_safe_borrow: f64,
    pub net_apy: f64,
    pub weighted_supply_apy: f64,
    pub weighted_borrow_apy: f64,
    pub data_timestamp: DateTime<Utc>,
    pub data_age_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub lookback_days_used: i64,
    pub portfolio_variance: f64,
    pub portfolio_volatility_annual: f64,
    pub var_95_1day: f64,
    pub var_99_1day: f64,
    pub cvar_95: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub correlation_matrix: CorrelationMatrix,
    pub delta_exposure: f64,
    pub lending_metrics: Option<LendingMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskProfileResponse {
    pub current_portfolio_value: f64,
    pub data_availability_warning: Option<String>,
    pub sensitivity_analysis: Vec<SensitivityPoint>,
    pub risk_metrics: RiskMetrics,
    pub scenarios: BTreeMap<String, ScenarioResult>,
}

/// Validate the position list before any database work.
pub fn validate_positions(positions: &[Position], config: &Config) -> Result<()> {
    if positions.is_empty() {
        return Err(ServiceError::Validation(
            "portfolio must contain at least one position".into(),
        ));
    }
    if positions.len() > config.max_portfolio_positions {
        return Err(ServiceError::Validation(format!(
            "maximum {} positions allowed",
            config.max_portfolio_positions
        )));
    }

    for (i, pos) in positions.iter().enumerate() {
        if pos.asset.trim().is_empty() {
            return Err(ServiceError::Validation(format!(
                "position {i} missing required field: asset"
            )));
        }
        if pos.quantity <= 0.0 || !pos.quantity.is_finite() {
            return Err(ServiceError::Validation(format!(
                "position {i} has invalid quantity: {}",
                pos.quantity
            )));
        }

        if pos.position_type.is_lending() {
            if pos.entry_timestamp.is_none() {
                return Err(ServiceError::Validation(format!(
                    "lending position {i} missing required field: entry_timestamp"
                )));
            }
            if pos.position_type == PositionType::LendingBorrow && pos.borrow_type.is_none() {
                return Err(ServiceError::Validation(format!(
                    "lending borrow position {i} missing required field: borrow_type"
                )));
            }
        } else {
            match pos.entry_price {
                Some(p) if p > 0.0 && p.is_finite() => {}
                Some(p) => {
                    return Err(ServiceError::Validation(format!(
                        "position {i} has invalid entry_price: {p}"
                    )))
                }
                None => {
                    return Err(ServiceError::Validation(format!(
                        "position {i} missing required field: entry_price"
                    )))
                }
            }
        }

        let leverage = pos.leverage_or_default();
        if leverage <= 0.0 || leverage > config.max_leverage {
            return Err(ServiceError::Validation(format!(
                "position {i} has invalid leverage: {leverage} (must be 0 < leverage <= {})",
                config.max_leverage
            )));
        }
    }

    Ok(())
}

fn validate_lookback(request: &RiskProfileRequest, config: &Config) -> Result<i64> {
    let lookback = request
        .lookback_days
        .unwrap_or(config.risk_default_lookback_days);
    if lookback < MIN_LOOKBACK_DAYS || lookback > config.risk_max_lookback_days {
        return Err(ServiceError::Validation(format!(
            "lookback_days must be between {MIN_LOOKBACK_DAYS} and {}",
            config.risk_max_lookback_days
        )));
    }
    Ok(lookback)
}

/// Compute the full risk profile for a request-scoped portfolio.
pub async fn calculate_risk_profile(
    db: &Database,
    config: &Config,
    request: RiskProfileRequest,
) -> Result<RiskProfileResponse> {
    validate_positions(&request.positions, config)?;
    let lookback_days = validate_lookback(&request, config)?;

    let mut positions = request.positions;
    info!("Calculating risk profile for {} positions", positions.len());

    let has_lending = positions.iter().any(|p| p.position_type.is_lending());
    let has_futures = positions.iter().any(|p| p.position_type.is_futures());

    let assets: Vec<String> = {
        let mut seen = HashSet::new();
        positions
            .iter()
            .filter(|p| seen.insert(p.asset.clone()))
            .map(|p| p.asset.clone())
            .collect()
    };

    let (panel, align_warnings, actual_days) =
        fetch_aligned_panel(db, config, &assets, lookback_days).await?;

    let mut warnings: Vec<String> = Vec::new();
    if has_futures && lookback_days > config.funding_rate_lookback_days {
        warnings.push(format!(
            "futures positions present: funding/mark coverage is limited to ~{} days, \
             longer lookbacks rely on forward-filled data",
            config.funding_rate_lookback_days
        ));
    }
    if actual_days < RELIABLE_DAYS {
        warnings.push(format!(
            "only {actual_days} days of data available (recommended: {RELIABLE_DAYS}+); \
             risk metrics may be unreliable"
        ));
    }
    if !align_warnings.is_empty() {
        warnings.push(align_warnings.join("; "));
    }
    let data_availability_warning = if warnings.is_empty() {
        None
    } else {
        Some(warnings.join(" | "))
    };

    // Resolve missing lending entry indices against the aligned grid.
    if has_lending {
        resolve_entry_indices(&mut positions, &panel)?;
    }

    let current_prices = extract_current_prices(&panel, &positions)?;
    let current_indices = if has_lending {
        Some(extract_current_indices(&panel, &positions))
    } else {
        None
    };

    let current_value =
        portfolio_value(&positions, &current_prices, current_indices.as_ref())?;
    info!("Current portfolio value: {current_value:.2}");

    let (portfolio_values, portfolio_returns) =
        historical_portfolio_series(&positions, &panel, has_lending)?;

    let shocks: Vec<f64> = config
        .sensitivity_range
        .iter()
        .map(|pct| *pct as f64 / 100.0)
        .collect();
    let sensitivity =
        sensitivity_table(&positions, &current_prices, &shocks, current_indices.as_ref())?;

    // Risk metrics over the historical simulation.
    let volatility = calculate_volatility(&portfolio_returns, true);
    let var_95 = calculate_var_historical(&portfolio_returns, 0.95, current_value);
    let var_99 = calculate_var_historical(&portfolio_returns, 0.99, current_value);
    let var_95_threshold = if portfolio_returns.is_empty() {
        0.0
    } else {
        quantile(&portfolio_returns, 0.05)
    };
    let cvar_95 = calculate_cvar(&portfolio_returns, var_95_threshold, current_value);
    let sharpe = calculate_sharpe_ratio(&portfolio_returns, config.risk_free_rate);
    let max_dd = calculate_max_drawdown(&portfolio_values);

    let asset_returns = per_asset_returns(&positions, &panel);
    let correlation = calculate_correlation_matrix(&asset_returns);

    let mut position_values: Vec<(String, f64)> = Vec::with_capacity(positions.len());
    for pos in &positions {
        let value = position_value(pos, &current_prices, current_indices.as_ref())?;
        position_values.push((pos.asset.clone(), value));
    }
    let variance = calculate_portfolio_variance(&position_values, &asset_returns, &correlation);

    let lending_metrics = if has_lending {
        Some(lending_account_metrics(
            &positions,
            &position_values,
            &panel,
            config,
        )?)
    } else {
        None
    };

    let risk_metrics = RiskMetrics {
        lookback_days_used: actual_days,
        portfolio_variance: variance,
        portfolio_volatility_annual: volatility,
        var_95_1day: var_95,
        var_99_1day: var_99,
        cvar_95,
        sharpe_ratio: sharpe,
        max_drawdown: max_dd,
        correlation_matrix: correlation,
        delta_exposure: delta_exposure(&positions),
        lending_metrics,
    };

    let scenarios = run_all_scenarios(&positions, &current_prices, current_indices.as_ref())?;

    Ok(RiskProfileResponse {
        current_portfolio_value: current_value,
        data_availability_warning,
        sensitivity_analysis: sensitivity,
        risk_metrics,
        scenarios,
    })
}

/// Look up entry indices on the aligned grid for lending positions that did
/// not supply one. Entries older than available history use the earliest
/// index with a logged warning.
fn resolve_entry_indices(positions: &mut [Position], panel: &AlignedPanel) -> Result<()> {
    for pos in positions.iter_mut() {
        if !pos.position_type.is_lending() || pos.entry_index.is_some() {
            continue;
        }

        let entry_ts = pos.entry_timestamp.ok_or_else(|| {
            ServiceError::Validation(format!(
                "lending position for {} missing entry_timestamp",
                pos.asset
            ))
        })?;

        let field = match pos.position_type {
            PositionType::LendingSupply => PanelField::LiquidityIndex,
            _ => PanelField::VariableBorrowIndex,
        };
        let column = panel.column(&pos.asset, field).ok_or_else(|| {
            ServiceError::Validation(format!(
                "no lending index data available for {}",
                pos.asset
            ))
        })?;

        let first_day = panel.days().first().copied();
        let row = if first_day.map(|d| entry_ts < d).unwrap_or(false) {
            warn!(
                "Entry timestamp {entry_ts} predates available data; using earliest index for {}",
                pos.asset
            );
            0
        } else {
            panel.closest_row(entry_ts).unwrap_or(0)
        };

        let index = column[row];
        pos.entry_index = Some(format!("{index}"));
        info!(
            "Looked up entry index for {} {}: {index}",
            pos.asset,
            pos.position_type.as_str()
        );
    }
    Ok(())
}

/// Latest panel prices keyed (asset, position_type); lending positions use
/// indices, not prices.
fn extract_current_prices(panel: &AlignedPanel, positions: &[Position]) -> Result<PriceMap> {
    let mut prices = PriceMap::new();
    for pos in positions {
        if pos.position_type.is_lending() {
            continue;
        }
        let field = match pos.position_type {
            PositionType::Spot => PanelField::Spot,
            _ => PanelField::FuturesMark,
        };
        let price = panel.latest(&pos.asset, field).ok_or_else(|| {
            let what = if pos.position_type == PositionType::Spot {
                "spot"
            } else {
                "futures"
            };
            ServiceError::Validation(format!(
                "no {what} data available for asset: {}",
                pos.asset
            ))
        })?;
        prices.insert((pos.asset.clone(), pos.position_type), price);
    }
    Ok(prices)
}

fn extract_current_indices(panel: &AlignedPanel, positions: &[Position]) -> IndexMap {
    let mut indices = IndexMap::new();
    for pos in positions {
        if !pos.position_type.is_lending() {
            continue;
        }
        indices
            .entry(pos.asset.clone())
            .or_insert_with(|| AssetIndices {
                liquidity_index: panel.latest(&pos.asset, PanelField::LiquidityIndex),
                variable_borrow_index: panel.latest(&pos.asset, PanelField::VariableBorrowIndex),
            });
    }
    indices
}

/// Revalue the portfolio on every aligned day and derive log returns.
fn historical_portfolio_series(
    positions: &[Position],
    panel: &AlignedPanel,
    has_lending: bool,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut values = Vec::with_capacity(panel.len());

    for row in 0..panel.len() {
        let mut prices = PriceMap::new();
        let mut indices = IndexMap::new();

        for pos in positions {
            if pos.position_type.is_lending() {
                indices
                    .entry(pos.asset.clone())
                    .or_insert_with(|| AssetIndices {
                        liquidity_index: panel.value_at(&pos.asset, PanelField::LiquidityIndex, row),
                        variable_borrow_index: panel.value_at(
                            &pos.asset,
                            PanelField::VariableBorrowIndex,
                            row,
                        ),
                    });
            } else {
                let field = match pos.position_type {
                    PositionType::Spot => PanelField::Spot,
                    _ => PanelField::FuturesMark,
                };
                if let Some(price) = panel.value_at(&pos.asset, field, row) {
                    prices.insert((pos.asset.clone(), pos.position_type), price);
                }
            }
        }

        let value = portfolio_value(
            positions,
            &prices,
            if has_lending { Some(&indices) } else { None },
        )?;
        values.push(value);
    }

    let returns = calculate_returns(&values);
    Ok((values, returns))
}

/// Daily log returns per unique asset: spot close preferred, futures mark
/// as fallback. Lending-only assets carry no return series.
fn per_asset_returns(positions: &[Position], panel: &AlignedPanel) -> HashMap<String, Vec<f64>> {
    let mut asset_returns = HashMap::new();
    let unique: HashSet<&String> = positions.iter().map(|p| &p.asset).collect();

    for asset in unique {
        let prices = panel
            .column(asset, PanelField::Spot)
            .or_else(|| panel.column(asset, PanelField::FuturesMark));
        if let Some(prices) = prices {
            let returns = calculate_returns(prices);
            if !returns.is_empty() {
                asset_returns.insert(asset.clone(), returns);
            }
        }
    }
    asset_returns
}

/// Account-level Aave metrics over the lending positions.
fn lending_account_metrics(
    positions: &[Position],
    position_values: &[(String, f64)],
    panel: &AlignedPanel,
    config: &Config,
) -> Result<LendingMetrics> {
    let mut supplies: Vec<(String, f64)> = Vec::new();
    let mut borrows: Vec<(String, f64, crate::models::BorrowType)> = Vec::new();

    for (pos, (_, value)) in positions.iter().zip(position_values) {
        match pos.position_type {
            PositionType::LendingSupply => supplies.push((pos.asset.clone(), *value)),
            PositionType::LendingBorrow => borrows.push((
                pos.asset.clone(),
                value.abs(),
                pos.borrow_type.unwrap_or(crate::models::BorrowType::Variable),
            )),
            _ => {}
        }
    }

    if supplies.is_empty() && borrows.is_empty() {
        return Err(ServiceError::Validation("no lending positions found".into()));
    }

    let total_collateral: f64 = supplies.iter().map(|(_, v)| v).sum();
    let total_debt: f64 = borrows.iter().map(|(_, v, _)| v).sum();
    let net = total_collateral - total_debt;

    let ltv = account_ltv(total_debt, total_collateral);
    let hf = health_factor(&supplies, total_debt, &config.aave_liquidation_thresholds);

    // Weighted max LTV over the collateral basket.
    let mut weighted_max_ltv = 0.0;
    if total_collateral > 0.0 {
        for (asset, value) in &supplies {
            let max_ltv = config.aave_max_ltv.get(asset).copied().unwrap_or(0.75);
            weighted_max_ltv += (value / total_collateral) * max_ltv;
        }
    }
    let max_safe_borrow = (total_collateral * weighted_max_ltv - total_debt).max(0.0);

    // Current rates off the latest aligned row.
    let rate_assets: HashSet<&String> = supplies
        .iter()
        .map(|(a, _)| a)
        .chain(borrows.iter().map(|(a, _, _)| a))
        .collect();
    let mut current_rates: HashMap<String, CurrentRates> = HashMap::new();
    for asset in rate_assets {
        current_rates.insert(
            asset.clone(),
            CurrentRates {
                supply_rate_ray: panel.latest(asset, PanelField::SupplyRate),
                variable_borrow_rate_ray: panel.latest(asset, PanelField::VariableBorrowRate),
                stable_borrow_rate_ray: panel.latest(asset, PanelField::StableBorrowRate),
            },
        );
    }

    let (net_apy, weighted_supply_apy, weighted_borrow_apy) =
        calculate_net_apy(&supplies, &borrows, &current_rates);

    // Staleness check against the latest aligned day.
    let data_timestamp = panel.latest_day().unwrap_or_else(Utc::now);
    let age_hours = (Utc::now() - data_timestamp).num_seconds() as f64 / 3600.0;
    let data_warning = if age_hours > config.lending_data_max_age_hours as f64 {
        let w = format!(
            "lending data is {age_hours:.1}h old (max: {}h); metrics may be stale",
            config.lending_data_max_age_hours
        );
        warn!("{w}");
        Some(w)
    } else {
        None
    };

    Ok(LendingMetrics {
        total_supplied_value: total_collateral,
        total_borrowed_value: total_debt,
        net_lending_value: net,
        current_ltv: ltv,
        health_factor: hf,
        max_safe_borrow,
        net_apy,
        weighted_supply_apy,
        weighted_borrow_apy,
        data_timestamp,
        data_age_hours: age_hours,
        data_warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_env()
    }

    fn spot(asset: &str, qty: f64, entry: f64) -> Position {
        Position {
            asset: asset.to_string(),
            quantity: qty,
            position_type: PositionType::Spot,
            entry_price: Some(entry),
            leverage: None,
            entry_timestamp: None,
            entry_index: None,
            borrow_type: None,
        }
    }

    #[test]
    fn rejects_empty_portfolio() {
        let err = validate_positions(&[], &config()).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn rejects_21_positions() {
        let positions: Vec<Position> = (0..21).map(|_| spot("BTC", 1.0, 100.0)).collect();
        assert!(validate_positions(&positions, &config()).is_err());

        let positions: Vec<Position> = (0..20).map(|_| spot("BTC", 1.0, 100.0)).collect();
        assert!(validate_positions(&positions, &config()).is_ok());
    }

    #[test]
    fn rejects_bad_quantity_and_entry_price() {
        let mut p = spot("BTC", 0.0, 100.0);
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());

        p.quantity = 1.0;
        p.entry_price = Some(-5.0);
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());

        p.entry_price = None;
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());
    }

    #[test]
    fn rejects_leverage_out_of_bounds() {
        let mut p = spot("ETH", 1.0, 100.0);
        p.position_type = PositionType::FuturesLong;
        p.leverage = Some(126.0);
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());

        p.leverage = Some(125.0);
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_ok());

        p.leverage = Some(0.0);
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());
    }

    #[test]
    fn lending_positions_need_timestamp_and_borrow_type() {
        let mut p = Position {
            asset: "WETH".to_string(),
            quantity: 1.0,
            position_type: PositionType::LendingSupply,
            entry_price: None,
            leverage: None,
            entry_timestamp: None,
            entry_index: None,
            borrow_type: None,
        };
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());

        p.entry_timestamp = Some(Utc::now());
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_ok());

        p.position_type = PositionType::LendingBorrow;
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_err());

        p.borrow_type = Some(crate::models::BorrowType::Variable);
        assert!(validate_positions(std::slice::from_ref(&p), &config()).is_ok());
    }

    #[test]
    fn lookback_bounds() {
        let cfg = config();
        let mk = |days: Option<i64>| RiskProfileRequest {
            positions: vec![spot("BTC", 1.0, 100.0)],
            lookback_days: days,
        };
        assert!(validate_lookback(&mk(Some(6)), &cfg).is_err());
        assert!(validate_lookback(&mk(Some(181)), &cfg).is_err());
        assert_eq!(validate_lookback(&mk(Some(7)), &cfg).unwrap(), 7);
        assert_eq!(validate_lookback(&mk(Some(180)), &cfg).unwrap(), 180);
        assert_eq!(
            validate_lookback(&mk(None), &cfg).unwrap(),
            cfg.risk_default_lookback_days
        );
    }
}

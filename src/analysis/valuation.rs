//! Portfolio position valuation, price-shock mapping, and sensitivity.

use crate::error::{Result, ServiceError};
use crate::models::{ray_str_to_f64, Position, PositionType};
use serde::Serialize;
use std::collections::HashMap;

/// Prices are keyed (asset, position_type) so spot and futures prices for
/// the same asset never collide.
pub type PriceKey = (String, PositionType);
pub type PriceMap = HashMap<PriceKey, f64>;

/// Current lending indices per asset (RAY scale, parsed to f64).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetIndices {
    pub liquidity_index: Option<f64>,
    pub variable_borrow_index: Option<f64>,
}

pub type IndexMap = HashMap<String, AssetIndices>;

#[derive(Debug, Clone, Serialize)]
pub struct SensitivityPoint {
    pub price_change_pct: f64,
    pub portfolio_value: f64,
    pub pnl: f64,
    pub return_pct: f64,
}

pub fn spot_value(quantity: f64, current_price: f64) -> f64 {
    quantity * current_price
}

/// Margin = qty * entry / leverage; PnL = (price - entry) * qty.
/// Leverage divides margin only and never multiplies PnL.
pub fn futures_long_value(
    quantity: f64,
    entry_price: f64,
    current_price: f64,
    leverage: f64,
) -> f64 {
    let margin = (quantity * entry_price) / leverage;
    let pnl = (current_price - entry_price) * quantity;
    margin + pnl
}

pub fn futures_short_value(
    quantity: f64,
    entry_price: f64,
    current_price: f64,
    leverage: f64,
) -> f64 {
    let margin = (quantity * entry_price) / leverage;
    let pnl = (entry_price - current_price) * quantity;
    margin + pnl
}

/// Supplied amount grows with the liquidity index ratio; always positive.
pub fn lending_supply_value(quantity: f64, entry_index: f64, current_index: f64) -> f64 {
    quantity * current_index / entry_index
}

/// Borrowed debt grows with the borrow index ratio; returned negative.
pub fn lending_borrow_value(quantity: f64, entry_index: f64, current_index: f64) -> f64 {
    -(quantity * current_index / entry_index)
}

/// Value one position against the given prices and indices.
pub fn position_value(
    position: &Position,
    prices: &PriceMap,
    indices: Option<&IndexMap>,
) -> Result<f64> {
    let asset = &position.asset;

    if position.position_type.is_lending() {
        let indices = indices.ok_or_else(|| {
            ServiceError::Validation(format!(
                "lending position for {asset} requires current indices"
            ))
        })?;
        let asset_indices = indices.get(asset).copied().unwrap_or_default();

        let entry_index = position
            .entry_index
            .as_deref()
            .and_then(ray_str_to_f64)
            .filter(|v| *v > 0.0)
            .ok_or_else(|| {
                ServiceError::Validation(format!(
                    "lending position for {asset} missing a usable entry_index"
                ))
            })?;

        return match position.position_type {
            PositionType::LendingSupply => {
                let current = asset_indices.liquidity_index.ok_or_else(|| {
                    ServiceError::Validation(format!("no liquidity index available for {asset}"))
                })?;
                Ok(lending_supply_value(position.quantity, entry_index, current))
            }
            PositionType::LendingBorrow => {
                // Stable borrows reuse the variable index as a first-order
                // approximation. TODO: track the per-position stable rate
                // fixed at entry_timestamp instead of the reserve index.
                let current = asset_indices.variable_borrow_index.ok_or_else(|| {
                    ServiceError::Validation(format!(
                        "no variable borrow index available for {asset}"
                    ))
                })?;
                Ok(lending_borrow_value(position.quantity, entry_index, current))
            }
            _ => unreachable!(),
        };
    }

    let price = prices
        .get(&(asset.clone(), position.position_type))
        .copied()
        .ok_or_else(|| {
            ServiceError::Validation(format!(
                "no current price available for {asset} ({})",
                position.position_type.as_str()
            ))
        })?;

    match position.position_type {
        PositionType::Spot => Ok(spot_value(position.quantity, price)),
        PositionType::FuturesLong => {
            let entry = position.entry_price.unwrap_or_default();
            Ok(futures_long_value(
                position.quantity,
                entry,
                price,
                position.leverage_or_default(),
            ))
        }
        PositionType::FuturesShort => {
            let entry = position.entry_price.unwrap_or_default();
            Ok(futures_short_value(
                position.quantity,
                entry,
                price,
                position.leverage_or_default(),
            ))
        }
        _ => unreachable!(),
    }
}

pub fn portfolio_value(
    positions: &[Position],
    prices: &PriceMap,
    indices: Option<&IndexMap>,
) -> Result<f64> {
    let mut total = 0.0;
    for position in positions {
        total += position_value(position, prices, indices)?;
    }
    Ok(total)
}

/// Uniform shock: every price scaled by (1 + shock).
pub fn apply_price_shock(prices: &PriceMap, shock: f64) -> PriceMap {
    prices
        .iter()
        .map(|(k, p)| (k.clone(), p * (1.0 + shock)))
        .collect()
}

/// Per-asset shocks with a `default` for unlisted assets.
pub fn apply_asset_shocks(
    prices: &PriceMap,
    shocks: &HashMap<String, f64>,
    default_shock: f64,
) -> PriceMap {
    prices
        .iter()
        .map(|((asset, pt), p)| {
            let shock = shocks.get(asset).copied().unwrap_or(default_shock);
            ((asset.clone(), *pt), p * (1.0 + shock))
        })
        .collect()
}

/// Net directional quantity. Leverage affects margin, never delta.
pub fn delta_exposure(positions: &[Position]) -> f64 {
    positions
        .iter()
        .map(|p| match p.position_type {
            PositionType::Spot | PositionType::FuturesLong => p.quantity,
            PositionType::FuturesShort => -p.quantity,
            _ => 0.0,
        })
        .sum()
}

/// Revalue the portfolio across a grid of decimal shocks. Lending-only
/// portfolios have no price keys, so every shock is a no-op on value.
pub fn sensitivity_table(
    positions: &[Position],
    base_prices: &PriceMap,
    shocks: &[f64],
    indices: Option<&IndexMap>,
) -> Result<Vec<SensitivityPoint>> {
    let base_value = portfolio_value(positions, base_prices, indices)?;
    let mut table = Vec::with_capacity(shocks.len());

    for &shock in shocks {
        let shocked_value = if base_prices.is_empty() {
            base_value
        } else {
            let shocked = apply_price_shock(base_prices, shock);
            portfolio_value(positions, &shocked, indices)?
        };
        let pnl = shocked_value - base_value;
        let return_pct = if base_value != 0.0 {
            pnl / base_value * 100.0
        } else {
            0.0
        };
        table.push(SensitivityPoint {
            price_change_pct: shock * 100.0,
            portfolio_value: shocked_value,
            pnl,
            return_pct,
        });
    }

    Ok(table)
}

/// Account LTV: debt / collateral, 0 when there is no collateral.
pub fn account_ltv(total_debt: f64, total_collateral: f64) -> f64 {
    if total_collateral > 0.0 {
        total_debt / total_collateral
    } else {
        0.0
    }
}

/// Aave health factor over (asset, supply value) pairs.
///
/// Returns `None` (infinite) with no debt, `0` with debt but no collateral.
pub fn health_factor(
    supplies: &[(String, f64)],
    total_debt: f64,
    liquidation_thresholds: &HashMap<String, f64>,
) -> Option<f64> {
    if total_debt <= 0.0 {
        return None;
    }

    let weighted: f64 = supplies
        .iter()
        .map(|(asset, value)| {
            let threshold = liquidation_thresholds.get(asset).copied().unwrap_or(0.75);
            value * threshold
        })
        .sum();

    Some(weighted / total_debt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot_pos(asset: &str, qty: f64, entry: f64) -> Position {
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

    fn futures_pos(asset: &str, qty: f64, entry: f64, lev: f64, long: bool) -> Position {
        Position {
            asset: asset.to_string(),
            quantity: qty,
            position_type: if long {
                PositionType::FuturesLong
            } else {
                PositionType::FuturesShort
            },
            entry_price: Some(entry),
            leverage: Some(lev),
            entry_timestamp: None,
            entry_index: None,
            borrow_type: None,
        }
    }

    fn prices_of(entries: &[(&str, PositionType, f64)]) -> PriceMap {
        entries
            .iter()
            .map(|(a, t, p)| ((a.to_string(), *t), *p))
            .collect()
    }

    #[test]
    fn spot_valuation() {
        let positions = vec![spot_pos("BTC", 1.0, 40_000.0)];
        let prices = prices_of(&[("BTC", PositionType::Spot, 50_000.0)]);
        let value = portfolio_value(&positions, &prices, None).unwrap();
        assert_eq!(value, 50_000.0);
    }

    #[test]
    fn futures_long_margin_and_pnl_separate() {
        // 10 ETH at entry 2000, 5x leverage, mark 2200:
        // margin = 10*2000/5 = 4000, pnl = 200*10 = 2000, value = 6000.
        let value = futures_long_value(10.0, 2000.0, 2200.0, 5.0);
        assert_eq!(value, 6000.0);

        // Short mirrors the PnL sign.
        let short = futures_short_value(10.0, 2000.0, 2200.0, 5.0);
        assert_eq!(short, 4000.0 - 2000.0);
    }

    #[test]
    fn leverage_multiplies_margin_never_pnl() {
        let v5 = futures_long_value(10.0, 2000.0, 2200.0, 5.0);
        let v10 = futures_long_value(10.0, 2000.0, 2200.0, 10.0);
        // Doubling leverage halves margin but leaves PnL unchanged.
        assert_eq!(v5 - v10, 2000.0);
    }

    #[test]
    fn lending_supply_accrues_with_index() {
        // 10 WETH at entry index 1.0 RAY, current 1.05 RAY -> 10.5 WETH.
        let value = lending_supply_value(10.0, 1e27, 1.05e27);
        assert!((value - 10.5).abs() < 1e-9);
    }

    #[test]
    fn lending_borrow_is_negative_debt() {
        let value = lending_borrow_value(100.0, 1e27, 1.1e27);
        assert!((value + 110.0).abs() < 1e-9);
    }

    #[test]
    fn delta_exposure_is_leverage_neutral() {
        let mut positions = vec![
            spot_pos("BTC", 1.0, 40_000.0),
            futures_pos("ETH", 10.0, 2000.0, 5.0, true),
            futures_pos("SOL", 4.0, 100.0, 3.0, false),
        ];
        let delta = delta_exposure(&positions);
        assert_eq!(delta, 1.0 + 10.0 - 4.0);

        // Doubling every leverage leaves delta unchanged.
        for p in &mut positions {
            if let Some(lev) = p.leverage.as_mut() {
                *lev *= 2.0;
            }
        }
        assert_eq!(delta_exposure(&positions), delta);
    }

    #[test]
    fn sensitivity_symmetry_for_pure_spot() {
        let positions = vec![spot_pos("BTC", 1.0, 40_000.0)];
        let prices = prices_of(&[("BTC", PositionType::Spot, 50_000.0)]);
        let shocks = vec![-0.10, 0.0, 0.10];
        let table = sensitivity_table(&positions, &prices, &shocks, None).unwrap();

        assert_eq!(table[1].portfolio_value, 50_000.0);
        assert_eq!(table[0].portfolio_value, 45_000.0);
        assert_eq!(table[2].portfolio_value, 55_000.0);
        // Spot value is linear in price.
        let sum = table[0].portfolio_value + table[2].portfolio_value;
        assert!((sum - 2.0 * 50_000.0).abs() < 1e-9);
        assert_eq!(table[2].price_change_pct, 10.0);
    }

    #[test]
    fn shocks_are_noop_for_lending_only() {
        let position = Position {
            asset: "WETH".to_string(),
            quantity: 10.0,
            position_type: PositionType::LendingSupply,
            entry_price: None,
            leverage: None,
            entry_timestamp: None,
            entry_index: Some("1000000000000000000000000000".to_string()),
            borrow_type: None,
        };
        let mut indices = IndexMap::new();
        indices.insert(
            "WETH".to_string(),
            AssetIndices {
                liquidity_index: Some(1.05e27),
                variable_borrow_index: None,
            },
        );

        let table = sensitivity_table(
            &[position],
            &PriceMap::new(),
            &[-0.30, 0.0, 0.30],
            Some(&indices),
        )
        .unwrap();
        assert!(table.iter().all(|p| (p.portfolio_value - 10.5).abs() < 1e-9));
        assert!(table.iter().all(|p| p.pnl.abs() < 1e-12));
    }

    #[test]
    fn asset_specific_shocks_use_default() {
        let prices = prices_of(&[
            ("BTC", PositionType::Spot, 50_000.0),
            ("ETH", PositionType::Spot, 3_000.0),
        ]);
        let mut shocks = HashMap::new();
        shocks.insert("BTC".to_string(), 0.40);
        let shocked = apply_asset_shocks(&prices, &shocks, -0.10);

        assert_eq!(shocked[&("BTC".to_string(), PositionType::Spot)], 70_000.0);
        assert_eq!(shocked[&("ETH".to_string(), PositionType::Spot)], 2_700.0);
    }

    #[test]
    fn health_factor_laws() {
        let mut thresholds = HashMap::new();
        thresholds.insert("WETH".to_string(), 0.825);

        let supplies = vec![("WETH".to_string(), 10_000.0)];
        // No debt -> infinite (None).
        assert!(health_factor(&supplies, 0.0, &thresholds).is_none());

        let hf = health_factor(&supplies, 7_500.0, &thresholds).unwrap();
        assert!((hf - 1.10).abs() < 1e-9);

        // Growing debt with fixed collateral strictly lowers HF.
        let hf2 = health_factor(&supplies, 8_000.0, &thresholds).unwrap();
        assert!(hf2 < hf);

        // Debt without collateral -> zero.
        let hf3 = health_factor(&[], 1_000.0, &thresholds).unwrap();
        assert_eq!(hf3, 0.0);
    }

    #[test]
    fn missing_price_is_validation_error() {
        let positions = vec![spot_pos("BTC", 1.0, 40_000.0)];
        let err = portfolio_value(&positions, &PriceMap::new(), None).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}

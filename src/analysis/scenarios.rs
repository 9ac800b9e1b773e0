//! Scenario catalogue and execution: fixed market shocks plus user-supplied
//! custom scenarios.

use crate::analysis::valuation::{
    apply_asset_shocks, apply_price_shock, portfolio_value, IndexMap, PriceMap,
};
use crate::error::Result;
use crate::models::Position;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub enum ScenarioShock {
    Uniform(f64),
    AssetSpecific {
        shocks: HashMap<String, f64>,
        default: f64,
    },
}

#[derive(Debug, Clone)]
pub struct ScenarioDef {
    pub key: &'static str,
    pub name: String,
    pub description: String,
    pub shock: ScenarioShock,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub description: String,
    pub portfolio_value: f64,
    pub pnl: f64,
    pub return_pct: f64,
}

/// The eight predefined market scenarios.
pub fn scenario_catalogue() -> Vec<ScenarioDef> {
    fn uniform(key: &'static str, name: &str, description: &str, shock: f64) -> ScenarioDef {
        ScenarioDef {
            key,
            name: name.to_string(),
            description: description.to_string(),
            shock: ScenarioShock::Uniform(shock),
        }
    }

    fn asset_specific(
        key: &'static str,
        name: &str,
        description: &str,
        shocks: &[(&str, f64)],
        default: f64,
    ) -> ScenarioDef {
        ScenarioDef {
            key,
            name: name.to_string(),
            description: description.to_string(),
            shock: ScenarioShock::AssetSpecific {
                shocks: shocks
                    .iter()
                    .map(|(a, s)| (a.to_string(), *s))
                    .collect(),
                default,
            },
        }
    }

    vec![
        uniform(
            "bull_market",
            "Bull Market (+30%)",
            "All assets increase by 30%",
            0.30,
        ),
        uniform(
            "bear_market",
            "Bear Market (-30%)",
            "All assets decrease by 30%",
            -0.30,
        ),
        uniform(
            "crypto_winter",
            "Crypto Winter (-50%)",
            "Severe bear market with 50% decline across all assets",
            -0.50,
        ),
        uniform(
            "moderate_rally",
            "Moderate Rally (+15%)",
            "Moderate upward movement of 15%",
            0.15,
        ),
        uniform(
            "flash_crash",
            "Flash Crash (-20%)",
            "Sudden sharp decline of 20%",
            -0.20,
        ),
        asset_specific(
            "btc_dominance",
            "BTC Dominance",
            "BTC +40%, other assets -10%",
            &[("BTC", 0.40)],
            -0.10,
        ),
        asset_specific(
            "alt_season",
            "Alt Season",
            "Altcoins rally: ETH/SOL +50%, BTC +20%",
            &[("BTC", 0.20), ("ETH", 0.50), ("SOL", 0.50)],
            0.35,
        ),
        asset_specific(
            "risk_off",
            "Risk-Off Environment",
            "Flight to quality: BTC -15%, altcoins -35%",
            &[("BTC", -0.15)],
            -0.35,
        ),
    ]
}

/// Revalue the portfolio under one scenario. Lending-only portfolios carry
/// no price keys, so shocks are no-ops on value.
pub fn run_scenario(
    positions: &[Position],
    base_prices: &PriceMap,
    indices: Option<&IndexMap>,
    scenario: &ScenarioDef,
) -> Result<ScenarioResult> {
    let base_value = portfolio_value(positions, base_prices, indices)?;

    let scenario_value = if base_prices.is_empty() {
        base_value
    } else {
        let shocked = match &scenario.shock {
            ScenarioShock::Uniform(shock) => apply_price_shock(base_prices, *shock),
            ScenarioShock::AssetSpecific { shocks, default } => {
                apply_asset_shocks(base_prices, shocks, *default)
            }
        };
        portfolio_value(positions, &shocked, indices)?
    };

    let pnl = scenario_value - base_value;
    let return_pct = if base_value != 0.0 {
        pnl / base_value * 100.0
    } else {
        0.0
    };

    Ok(ScenarioResult {
        name: scenario.name.clone(),
        description: scenario.description.clone(),
        portfolio_value: scenario_value,
        pnl,
        return_pct,
    })
}

/// Run the full catalogue, keyed by scenario key.
pub fn run_all_scenarios(
    positions: &[Position],
    base_prices: &PriceMap,
    indices: Option<&IndexMap>,
) -> Result<BTreeMap<String, ScenarioResult>> {
    let mut results = BTreeMap::new();
    for scenario in scenario_catalogue() {
        let result = run_scenario(positions, base_prices, indices, &scenario)?;
        results.insert(scenario.key.to_string(), result);
    }
    Ok(results)
}

/// Build a one-off scenario from user-supplied shocks.
pub fn custom_scenario(
    name: &str,
    description: &str,
    asset_shocks: Option<HashMap<String, f64>>,
    uniform_shock: Option<f64>,
) -> Result<ScenarioDef> {
    let shock = match (asset_shocks, uniform_shock) {
        (Some(mut shocks), _) => {
            let default = shocks.remove("default").unwrap_or(0.0);
            ScenarioShock::AssetSpecific { shocks, default }
        }
        (None, Some(shock)) => ScenarioShock::Uniform(shock),
        (None, None) => {
            return Err(crate::error::ServiceError::Validation(
                "custom scenario needs asset_shocks or uniform_shock".into(),
            ))
        }
    };
    Ok(ScenarioDef {
        key: "custom",
        name: name.to_string(),
        description: description.to_string(),
        shock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionType;

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

    fn price_map(entries: &[(&str, f64)]) -> PriceMap {
        entries
            .iter()
            .map(|(a, p)| ((a.to_string(), PositionType::Spot), *p))
            .collect()
    }

    #[test]
    fn catalogue_has_eight_scenarios() {
        let keys: Vec<&str> = scenario_catalogue().iter().map(|s| s.key).collect();
        assert_eq!(keys.len(), 8);
        for expected in [
            "bull_market",
            "bear_market",
            "crypto_winter",
            "moderate_rally",
            "flash_crash",
            "btc_dominance",
            "alt_season",
            "risk_off",
        ] {
            assert!(keys.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn flash_crash_is_exactly_minus_20_pct() {
        let positions = vec![spot("BTC", 1.0, 50_000.0)];
        let prices = price_map(&[("BTC", 50_000.0)]);

        let results = run_all_scenarios(&positions, &prices, None).unwrap();
        let crash = &results["flash_crash"];
        assert!((crash.return_pct + 20.0).abs() < 1e-9);
        assert!((crash.portfolio_value - 40_000.0).abs() < 1e-9);
    }

    #[test]
    fn alt_season_is_value_weighted() {
        // BTC 1 @ 50k (+20%), ETH 10 @ 3k (+50%).
        let positions = vec![spot("BTC", 1.0, 50_000.0), spot("ETH", 10.0, 3_000.0)];
        let prices = price_map(&[("BTC", 50_000.0), ("ETH", 3_000.0)]);

        let results = run_all_scenarios(&positions, &prices, None).unwrap();
        let alt = &results["alt_season"];

        let expected_value = 50_000.0 * 1.20 + 30_000.0 * 1.50;
        assert!((alt.portfolio_value - expected_value).abs() < 1e-9);

        let expected_return = (expected_value - 80_000.0) / 80_000.0 * 100.0;
        assert!((alt.return_pct - expected_return).abs() < 1e-9);
    }

    #[test]
    fn btc_dominance_applies_default_to_others() {
        let positions = vec![spot("BTC", 1.0, 50_000.0), spot("SOL", 100.0, 100.0)];
        let prices = price_map(&[("BTC", 50_000.0), ("SOL", 100.0)]);

        let results = run_all_scenarios(&positions, &prices, None).unwrap();
        let dom = &results["btc_dominance"];
        let expected = 50_000.0 * 1.40 + 10_000.0 * 0.90;
        assert!((dom.portfolio_value - expected).abs() < 1e-9);
    }

    #[test]
    fn custom_scenario_shapes() {
        let mut shocks = HashMap::new();
        shocks.insert("BTC".to_string(), 0.1);
        shocks.insert("default".to_string(), -0.05);
        let def = custom_scenario("Custom", "test", Some(shocks), None).unwrap();
        match def.shock {
            ScenarioShock::AssetSpecific { shocks, default } => {
                assert_eq!(shocks.len(), 1);
                assert_eq!(default, -0.05);
            }
            _ => panic!("expected asset-specific shock"),
        }

        assert!(custom_scenario("x", "y", None, None).is_err());
    }
}

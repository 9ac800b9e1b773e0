//! Risk metric primitives: returns, volatility, VaR/CVaR, Sharpe, drawdown,
//! correlation, portfolio variance, and lending APY aggregation.

use crate::models::{ray_to_apy_pct, BorrowType};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Periods per year for daily series.
pub const PERIODS_PER_YEAR: f64 = 365.0;

/// Log returns r_t = ln(P_t / P_{t-1}); non-finite values are dropped.
pub fn calculate_returns(prices: &[f64]) -> Vec<f64> {
    if prices.len() < 2 {
        return Vec::new();
    }
    prices
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .filter(|r| r.is_finite())
        .collect()
}

/// Sample standard deviation (ddof = 1), annualized by sqrt(N) on request.
pub fn calculate_volatility(returns: &[f64], annualize: bool) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let vol = returns.std_dev();
    if annualize {
        vol * PERIODS_PER_YEAR.sqrt()
    } else {
        vol
    }
}

/// Linear-interpolation quantile over an unsorted sample (numpy's default).
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let h = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Historical-simulation VaR: V * quantile(returns, 1 - confidence).
/// Signed: a potential loss comes out negative.
pub fn calculate_var_historical(
    returns: &[f64],
    confidence_level: f64,
    portfolio_value: f64,
) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let q = quantile(returns, 1.0 - confidence_level);
    let var = portfolio_value * q;
    debug!("VaR {:.0}%: {var:.2} (quantile {q:.4})", confidence_level * 100.0);
    var
}

/// Expected shortfall below `var_threshold` (a return, not a dollar value).
/// Falls back to the VaR itself when no returns sit in the tail.
pub fn calculate_cvar(returns: &[f64], var_threshold: f64, portfolio_value: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let tail: Vec<f64> = returns
        .iter()
        .copied()
        .filter(|r| *r <= var_threshold)
        .collect();
    if tail.is_empty() {
        return portfolio_value * var_threshold;
    }
    let mean_tail = tail.iter().sum::<f64>() / tail.len() as f64;
    portfolio_value * mean_tail
}

/// Annualized Sharpe: (mean(r) * N - rf) / (std(r) * sqrt(N)).
pub fn calculate_sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.mean();
    let std = returns.std_dev();
    if std == 0.0 || !std.is_finite() {
        return 0.0;
    }
    (mean * PERIODS_PER_YEAR - risk_free_rate) / (std * PERIODS_PER_YEAR.sqrt())
}

/// Maximum drawdown from a running peak, as a negative decimal.
pub fn calculate_max_drawdown(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mut peak = values[0];
    let mut max_dd = 0.0f64;
    for &v in values {
        if v > peak {
            peak = v;
        }
        if peak > 0.0 {
            let dd = (v - peak) / peak;
            if dd < max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

pub type CorrelationMatrix = BTreeMap<String, BTreeMap<String, f64>>;

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = x.mean();
    let my = y.mean();

    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        let dy = y[i] - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    if vx == 0.0 || vy == 0.0 {
        return 0.0;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

/// Pearson correlation matrix over per-asset return series, truncated to the
/// shortest length. Symmetric with a unit diagonal.
pub fn calculate_correlation_matrix(
    multi_asset_returns: &HashMap<String, Vec<f64>>,
) -> CorrelationMatrix {
    let mut matrix = CorrelationMatrix::new();
    if multi_asset_returns.is_empty() {
        return matrix;
    }

    let min_len = multi_asset_returns
        .values()
        .map(|r| r.len())
        .min()
        .unwrap_or(0);

    let assets: Vec<&String> = multi_asset_returns.keys().collect();
    for a in &assets {
        let mut row = BTreeMap::new();
        for b in &assets {
            let rho = if a == b {
                1.0
            } else {
                pearson(
                    &multi_asset_returns[*a][..min_len],
                    &multi_asset_returns[*b][..min_len],
                )
            };
            row.insert((*b).clone(), rho);
        }
        matrix.insert((*a).clone(), row);
    }
    matrix
}

/// Portfolio variance via the covariance matrix:
/// sigma_p^2 = sum_ab w_a w_b sigma_a sigma_b rho_ab with value weights.
pub fn calculate_portfolio_variance(
    position_values: &[(String, f64)],
    asset_returns: &HashMap<String, Vec<f64>>,
    correlation: &CorrelationMatrix,
) -> f64 {
    let total: f64 = position_values.iter().map(|(_, v)| v).sum();
    if total == 0.0 || position_values.is_empty() {
        return 0.0;
    }

    // Merge positions on the same asset into one weight.
    let mut weights: HashMap<&str, f64> = HashMap::new();
    for (asset, value) in position_values {
        *weights.entry(asset.as_str()).or_default() += value / total;
    }

    let vol_of = |asset: &str| -> f64 {
        asset_returns
            .get(asset)
            .map(|r| calculate_volatility(r, false))
            .unwrap_or(0.0)
    };

    let mut variance = 0.0;
    for (a, wa) in &weights {
        for (b, wb) in &weights {
            let rho = correlation
                .get(*a)
                .and_then(|row| row.get(*b))
                .copied()
                .unwrap_or(0.0);
            variance += wa * wb * vol_of(a) * vol_of(b) * rho;
        }
    }
    variance
}

/// Current RAY rates for one lending asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentRates {
    pub supply_rate_ray: Option<f64>,
    pub variable_borrow_rate_ray: Option<f64>,
    pub stable_borrow_rate_ray: Option<f64>,
}

/// Value-weighted supply/borrow APYs and the net APY over net value.
///
/// Returns (net_apy, weighted_supply_apy, weighted_borrow_apy) in percent.
/// Borrow values are passed positive; `net_apy` divides by |net| when the
/// account is over-leveraged and is 0 at exactly zero net value.
pub fn calculate_net_apy(
    supply_positions: &[(String, f64)],
    borrow_positions: &[(String, f64, BorrowType)],
    current_rates: &HashMap<String, CurrentRates>,
) -> (f64, f64, f64) {
    let mut total_supply = 0.0;
    let mut supply_yield = 0.0;
    for (asset, value) in supply_positions {
        total_supply += value;
        let apy = current_rates
            .get(asset)
            .and_then(|r| r.supply_rate_ray)
            .map(ray_to_apy_pct)
            .unwrap_or(0.0);
        supply_yield += value * apy;
    }

    let mut total_borrow = 0.0;
    let mut borrow_cost = 0.0;
    for (asset, value, borrow_type) in borrow_positions {
        let value = value.abs();
        total_borrow += value;
        let rates = current_rates.get(asset).copied().unwrap_or_default();
        let rate_ray = match borrow_type {
            BorrowType::Stable => rates
                .stable_borrow_rate_ray
                .or(rates.variable_borrow_rate_ray),
            BorrowType::Variable => rates.variable_borrow_rate_ray,
        };
        borrow_cost += value * rate_ray.map(ray_to_apy_pct).unwrap_or(0.0);
    }

    let weighted_supply_apy = if total_supply > 0.0 {
        supply_yield / total_supply
    } else {
        0.0
    };
    let weighted_borrow_apy = if total_borrow > 0.0 {
        borrow_cost / total_borrow
    } else {
        0.0
    };

    let net_value = total_supply - total_borrow;
    let net_apy = if net_value != 0.0 {
        (supply_yield - borrow_cost) / net_value.abs()
    } else {
        0.0
    };

    (net_apy, weighted_supply_apy, weighted_borrow_apy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RAY;

    #[test]
    fn log_returns_filter_non_finite() {
        let returns = calculate_returns(&[100.0, 110.0, 0.0, 120.0]);
        // ln(0/110) = -inf and ln(120/0) = +inf are both dropped.
        assert_eq!(returns.len(), 1);
        assert!((returns[0] - (110.0f64 / 100.0).ln()).abs() < 1e-12);

        assert!(calculate_returns(&[100.0]).is_empty());
    }

    #[test]
    fn volatility_annualization() {
        let returns = vec![0.01, -0.02, 0.015, 0.005, -0.01];
        let daily = calculate_volatility(&returns, false);
        let annual = calculate_volatility(&returns, true);
        assert!((annual - daily * 365.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn var_ordering_and_sign() {
        // Mixed sample with clear downside tail.
        let returns: Vec<f64> = (0..100)
            .map(|i| ((i as f64) - 50.0) / 1000.0)
            .collect();
        let value = 100_000.0;
        let var95 = calculate_var_historical(&returns, 0.95, value);
        let var99 = calculate_var_historical(&returns, 0.99, value);

        assert!(var95 < 0.0);
        assert!(var99 <= var95, "VaR99 {var99} must not exceed VaR95 {var95}");
    }

    #[test]
    fn cvar_is_tail_mean_with_var_fallback() {
        let returns = vec![-0.10, -0.05, 0.0, 0.01, 0.02];
        let q05 = quantile(&returns, 0.05);
        let cvar = calculate_cvar(&returns, q05, 1000.0);
        // Only the worst return sits at/below the 5% quantile here.
        assert!(cvar <= 1000.0 * q05 + 1e-9);

        // Threshold below every sample: fall back to VaR itself.
        let fallback = calculate_cvar(&returns, -0.5, 1000.0);
        assert_eq!(fallback, -500.0);
    }

    #[test]
    fn sharpe_zero_for_flat_series() {
        assert_eq!(calculate_sharpe_ratio(&[0.01, 0.01, 0.01], 0.0), 0.0);

        let sharpe = calculate_sharpe_ratio(&[0.01, -0.005, 0.02, 0.0], 0.0);
        assert!(sharpe.is_finite());
        assert!(sharpe > 0.0);
    }

    #[test]
    fn max_drawdown_running_peak() {
        let values = vec![100.0, 120.0, 90.0, 110.0, 80.0];
        let dd = calculate_max_drawdown(&values);
        // Worst: 120 -> 80.
        assert!((dd - (80.0 - 120.0) / 120.0).abs() < 1e-12);

        assert_eq!(calculate_max_drawdown(&[100.0, 110.0, 120.0]), 0.0);
    }

    #[test]
    fn correlation_matrix_laws() {
        let mut returns = HashMap::new();
        let base: Vec<f64> = vec![0.01, -0.02, 0.015, 0.005, -0.01, 0.02];
        returns.insert("BTC".to_string(), base.clone());
        returns.insert("ETH".to_string(), base.clone());
        returns.insert("SOL".to_string(), base.iter().map(|r| -r).collect());

        let matrix = calculate_correlation_matrix(&returns);
        for (a, row) in &matrix {
            assert!((row[a] - 1.0).abs() < 1e-9, "unit diagonal");
            for (b, rho) in row {
                assert!((-1.0..=1.0).contains(rho));
                assert!((matrix[b][a] - rho).abs() < 1e-9, "symmetry");
            }
        }
        // Identical series correlate at 1, negated at -1.
        assert!((matrix["BTC"]["ETH"] - 1.0).abs() < 1e-9);
        assert!((matrix["BTC"]["SOL"] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn portfolio_variance_two_assets() {
        let mut returns = HashMap::new();
        returns.insert("A".to_string(), vec![0.01, -0.01, 0.02, -0.02]);
        returns.insert("B".to_string(), vec![0.02, -0.02, 0.04, -0.04]);
        let corr = calculate_correlation_matrix(&returns);

        let positions = vec![("A".to_string(), 500.0), ("B".to_string(), 500.0)];
        let variance = calculate_portfolio_variance(&positions, &returns, &corr);

        let sa = calculate_volatility(&returns["A"], false);
        let sb = calculate_volatility(&returns["B"], false);
        // Perfect correlation: sigma_p = w_a*sigma_a + w_b*sigma_b.
        let expected = (0.5 * sa + 0.5 * sb).powi(2);
        assert!((variance - expected).abs() < 1e-12);
    }

    #[test]
    fn net_apy_weighted_and_signed() {
        let mut rates = HashMap::new();
        rates.insert(
            "USDC".to_string(),
            CurrentRates {
                supply_rate_ray: Some(0.05 * RAY),
                variable_borrow_rate_ray: Some(0.08 * RAY),
                stable_borrow_rate_ray: None,
            },
        );

        let supplies = vec![("USDC".to_string(), 10_000.0)];
        let borrows = vec![("USDC".to_string(), 5_000.0, BorrowType::Variable)];
        let (net, supply_apy, borrow_apy) = calculate_net_apy(&supplies, &borrows, &rates);

        assert!(supply_apy > 5.0 && supply_apy < 5.3);
        assert!(borrow_apy > 8.0 && borrow_apy < 8.5);
        // net = (10000*s - 5000*b) / 5000.
        let expected = (10_000.0 * supply_apy - 5_000.0 * borrow_apy) / 5_000.0;
        assert!((net - expected).abs() < 1e-9);

        // Zero net value returns 0.
        let borrows_equal = vec![("USDC".to_string(), 10_000.0, BorrowType::Variable)];
        let (net_zero, _, _) = calculate_net_apy(&supplies, &borrows_equal, &rates);
        assert_eq!(net_zero, 0.0);
    }

    #[test]
    fn stable_borrow_falls_back_to_variable_rate() {
        let mut rates = HashMap::new();
        rates.insert(
            "DAI".to_string(),
            CurrentRates {
                supply_rate_ray: None,
                variable_borrow_rate_ray: Some(0.06 * RAY),
                stable_borrow_rate_ray: None,
            },
        );
        let borrows = vec![("DAI".to_string(), 1_000.0, BorrowType::Stable)];
        let (_, _, borrow_apy) = calculate_net_apy(&[], &borrows, &rates);
        assert!(borrow_apy > 6.0);
    }
}

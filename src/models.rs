//! Shared domain types: market-data rows, portfolio positions, RAY math.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aave fixed-point scale: 1.0 == 10^27.
pub const RAY: f64 = 1e27;
/// Seconds per year used for per-second APY compounding.
pub const SEC_PER_YEAR: f64 = 31_536_000.0;
/// Overflow guard for per-second compounding of absurd APRs.
pub const MAX_APY_PCT: f64 = 1_000_000.0;

/// Metric families persisted by the ingestion pipeline.
///
/// One `backfill_state` row exists per (asset, metric).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    SpotOhlcv,
    FutFunding,
    FutMarkKlines,
    FutIndexKlines,
    FutOpenInterest,
    Lending,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::SpotOhlcv => "spot_ohlcv",
            Metric::FutFunding => "fut_funding",
            Metric::FutMarkKlines => "fut_mark_klines",
            Metric::FutIndexKlines => "fut_index_klines",
            Metric::FutOpenInterest => "fut_open_interest",
            Metric::Lending => "lending",
        }
    }
}

/// A 12h spot candle. `filled` marks candles synthesized by the API's
/// forward-fill option, never stored rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvCandle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub filled: bool,
}

/// Perpetual funding event (8h native cadence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateRow {
    pub timestamp: DateTime<Utc>,
    pub funding_rate: f64,
    pub mark_price: Option<f64>,
}

/// Mark- or index-price kline at the configured futures interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesKline {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterestRow {
    pub timestamp: DateTime<Utc>,
    pub open_interest: f64,
}

/// Daily Aave reserve snapshot. RAY quantities stay decimal strings end to
/// end; analytics parse them to f64 on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LendingRow {
    pub timestamp: DateTime<Utc>,
    pub supply_rate_ray: String,
    pub var_borrow_rate_ray: String,
    pub stable_borrow_rate_ray: String,
    pub liquidity_index: String,
    pub variable_borrow_index: String,
}

/// Parse a RAY decimal string into f64. Loses precision beyond ~15 digits,
/// which is acceptable for analytics (wire responses keep the string form).
pub fn ray_str_to_f64(raw: &str) -> Option<f64> {
    let v = raw.trim().parse::<f64>().ok()?;
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

/// Convert a RAY-scaled annual rate into an effective APY percentage via
/// per-second compounding: APY = (1 + APR/N)^N - 1, N = seconds per year.
/// Capped at 1,000,000% to guard against overflow on absurd rates.
pub fn ray_to_apy_pct(rate_ray: f64) -> f64 {
    let apr = rate_ray / RAY;
    let apy = (1.0 + apr / SEC_PER_YEAR).powf(SEC_PER_YEAR) - 1.0;
    if !apy.is_finite() {
        return MAX_APY_PCT;
    }
    (apy * 100.0).min(MAX_APY_PCT)
}

/// Inverse of [`ray_to_apy_pct`] for round-trip checks: APR = ln(1 + APY).
pub fn apy_pct_to_ray(apy_pct: f64) -> f64 {
    let apy = apy_pct / 100.0;
    let apr = SEC_PER_YEAR * ((1.0 + apy).powf(1.0 / SEC_PER_YEAR) - 1.0);
    apr * RAY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionType {
    Spot,
    FuturesLong,
    FuturesShort,
    LendingSupply,
    LendingBorrow,
}

impl PositionType {
    pub fn is_lending(&self) -> bool {
        matches!(self, PositionType::LendingSupply | PositionType::LendingBorrow)
    }

    pub fn is_futures(&self) -> bool {
        matches!(self, PositionType::FuturesLong | PositionType::FuturesShort)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionType::Spot => "spot",
            PositionType::FuturesLong => "futures_long",
            PositionType::FuturesShort => "futures_short",
            PositionType::LendingSupply => "lending_supply",
            PositionType::LendingBorrow => "lending_borrow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorrowType {
    Variable,
    Stable,
}

/// A single request-scoped portfolio position. Field requirements depend on
/// the position type and are enforced by the risk-profile validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    pub quantity: f64,
    pub position_type: PositionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_timestamp: Option<DateTime<Utc>>,
    /// RAY decimal string; looked up on the aligned grid when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrow_type: Option<BorrowType>,
}

impl Position {
    pub fn leverage_or_default(&self) -> f64 {
        self.leverage.unwrap_or(1.0)
    }
}

/// Per-(asset, metric) ingestion progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillState {
    pub asset: String,
    pub metric: String,
    pub completed: bool,
    pub last_fetched_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_type_wire_names() {
        let p: PositionType = serde_json::from_str("\"futures_long\"").unwrap();
        assert_eq!(p, PositionType::FuturesLong);
        assert!(p.is_futures());
        assert!(!p.is_lending());
        assert_eq!(
            serde_json::to_string(&PositionType::LendingBorrow).unwrap(),
            "\"lending_borrow\""
        );
    }

    #[test]
    fn ray_conversion_known_values() {
        // Zero rate -> zero APY.
        assert_eq!(ray_to_apy_pct(0.0), 0.0);

        // 5% APR compounded per second is slightly above 5.12% APY.
        let apy = ray_to_apy_pct(0.05 * RAY);
        assert!((apy - 5.127).abs() < 0.01, "apy = {apy}");
    }

    #[test]
    fn ray_apy_round_trip_within_1ppm() {
        for apr in [0.001, 0.02, 0.05, 0.25, 1.0] {
            let ray = apr * RAY;
            let apy = ray_to_apy_pct(ray);
            let back = apy_pct_to_ray(apy);
            let rel = ((back - ray) / ray).abs();
            assert!(rel < 1e-6, "apr {apr}: relative error {rel}");
        }
    }

    #[test]
    fn ray_apy_overflow_capped() {
        // 10,000x APR would overflow the compounding; must cap at 1e6 %.
        let apy = ray_to_apy_pct(1e4 * RAY);
        assert!(apy <= MAX_APY_PCT);

        let absurd = ray_to_apy_pct(f64::MAX);
        assert_eq!(absurd, MAX_APY_PCT);
    }

    #[test]
    fn ray_string_parsing() {
        let one = ray_str_to_f64("1000000000000000000000000000").unwrap();
        assert!((one - RAY).abs() / RAY < 1e-12);
        assert!(ray_str_to_f64("not-a-number").is_none());
    }

    #[test]
    fn position_deserializes_with_optional_fields() {
        let raw = r#"{
            "asset": "WETH",
            "quantity": 10.0,
            "position_type": "lending_supply",
            "entry_timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let p: Position = serde_json::from_str(raw).unwrap();
        assert_eq!(p.asset, "WETH");
        assert!(p.entry_price.is_none());
        assert!(p.entry_index.is_none());
        assert_eq!(p.leverage_or_default(), 1.0);
    }
}

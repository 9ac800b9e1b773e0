//! Application configuration loaded from environment variables.

use std::collections::HashMap;
use std::env;

/// Service configuration.
///
/// Every field has a working default so the service boots with an empty
/// environment; `.env` files are honoured via dotenv in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (DATABASE_URL).
    pub database_url: String,
    /// Static API key for trigger-style endpoints (X-API-KEY header).
    pub api_key: String,
    pub log_level: String,

    // Tracked asset universes
    pub tracked_assets: Vec<String>,
    pub tracked_futures_assets: Vec<String>,
    pub tracked_lending_assets: Vec<String>,

    // Scheduler cadences
    pub fetch_interval_hours: u64,
    pub futures_funding_interval_hours: u64,
    pub futures_klines_interval: String,
    pub futures_oi_period: String,
    pub lending_fetch_interval_hours: u64,

    // Backfill windows
    pub initial_backfill_days: i64,
    pub initial_lending_backfill_days: i64,
    pub min_backfill_days: i64,

    // Risk analysis
    pub risk_default_lookback_days: i64,
    pub risk_max_lookback_days: i64,
    /// Provider retention limit for open interest / funding coverage checks.
    pub funding_rate_lookback_days: i64,
    pub max_portfolio_positions: usize,
    pub max_leverage: f64,
    /// Price shock grid in whole percent (e.g. -30..=30 step 5).
    pub sensitivity_range: Vec<i64>,
    pub var_confidence_levels: Vec<f64>,
    pub risk_free_rate: f64,
    pub lending_data_max_age_hours: i64,

    // Binance provider
    pub binance_api_base_url: String,
    pub binance_futures_api_base_url: String,
    pub binance_rate_limit_requests_per_minute: u32,
    pub binance_request_delay_ms: u64,

    // Dune provider (lending)
    pub dune_api_key: Option<String>,
    pub dune_lending_query_id: u64,

    // Aave V3 risk parameters (Ethereum mainnet)
    pub aave_liquidation_thresholds: HashMap<String, f64>,
    pub aave_max_ltv: HashMap<String, f64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env_str("DATABASE_URL", "./riskfolio.db"),
            api_key: env_str("API_KEY", "change-this-in-production"),
            log_level: env_str("LOG_LEVEL", "info"),

            tracked_assets: env_list("TRACKED_ASSETS", "BTC,ETH,SOL,BNB,XRP,ADA,LINK"),
            tracked_futures_assets: env_list(
                "TRACKED_FUTURES_ASSETS",
                "BTC,ETH,SOL,BNB,XRP,ADA,LINK",
            ),
            tracked_lending_assets: env_list("TRACKED_LENDING_ASSETS", "WETH,WBTC,USDC,USDT,DAI"),

            fetch_interval_hours: env_parse("FETCH_INTERVAL_HOURS", 12),
            futures_funding_interval_hours: env_parse("FUTURES_FUNDING_INTERVAL_HOURS", 8),
            futures_klines_interval: env_str("FUTURES_KLINES_INTERVAL", "8h"),
            futures_oi_period: env_str("FUTURES_OI_PERIOD", "5m"),
            lending_fetch_interval_hours: env_parse("LENDING_FETCH_INTERVAL_HOURS", 24),

            initial_backfill_days: env_parse("INITIAL_BACKFILL_DAYS", 730),
            initial_lending_backfill_days: env_parse("INITIAL_LENDING_BACKFILL_DAYS", 730),
            min_backfill_days: env_parse("MIN_BACKFILL_DAYS", 90),

            risk_default_lookback_days: env_parse("RISK_ANALYSIS_DEFAULT_LOOKBACK_DAYS", 30),
            risk_max_lookback_days: env_parse("RISK_ANALYSIS_MAX_LOOKBACK_DAYS", 180),
            funding_rate_lookback_days: env_parse("FUNDING_RATE_LOOKBACK_DAYS", 30).min(30),
            max_portfolio_positions: env_parse("MAX_PORTFOLIO_POSITIONS", 20),
            max_leverage: env_parse("MAX_LEVERAGE_LIMIT", 125.0),
            sensitivity_range: env_num_list(
                "SENSITIVITY_RANGE",
                &[-30, -25, -20, -15, -10, -5, 0, 5, 10, 15, 20, 25, 30],
            ),
            var_confidence_levels: env_num_list("VAR_CONFIDENCE_LEVELS", &[0.95, 0.99]),
            risk_free_rate: env_parse("RISK_FREE_RATE", 0.0),
            lending_data_max_age_hours: env_parse("LENDING_DATA_MAX_AGE_HOURS", 48),

            binance_api_base_url: env_str("BINANCE_API_BASE_URL", "https://api.binance.com"),
            binance_futures_api_base_url: env_str(
                "BINANCE_FUTURES_API_BASE_URL",
                "https://fapi.binance.com",
            ),
            binance_rate_limit_requests_per_minute: env_parse(
                "BINANCE_RATE_LIMIT_REQUESTS_PER_MINUTE",
                2400,
            ),
            binance_request_delay_ms: env_parse("BINANCE_REQUEST_DELAY_MS", 100),

            dune_api_key: env::var("DUNE_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            dune_lending_query_id: env_parse("DUNE_LENDING_QUERY_ID", 3_328_916),

            aave_liquidation_thresholds: env_asset_map(
                "AAVE_LIQUIDATION_THRESHOLDS",
                &[
                    ("WETH", 0.825),
                    ("WBTC", 0.750),
                    ("USDC", 0.870),
                    ("USDT", 0.870),
                    ("DAI", 0.800),
                ],
            ),
            aave_max_ltv: env_asset_map(
                "AAVE_MAX_LTV",
                &[
                    ("WETH", 0.800),
                    ("WBTC", 0.700),
                    ("USDC", 0.850),
                    ("USDT", 0.850),
                    ("DAI", 0.750),
                ],
            ),
        }
    }

    /// Map user-facing symbols onto Aave reserve symbols (BTC -> WBTC, ETH -> WETH).
    pub fn lending_symbol(&self, asset: &str) -> String {
        match asset.to_uppercase().as_str() {
            "BTC" => "WBTC".to_string(),
            "ETH" => "WETH".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_tracked_spot(&self, asset: &str) -> bool {
        self.tracked_assets.iter().any(|a| a == asset)
    }

    pub fn is_tracked_futures(&self, asset: &str) -> bool {
        self.tracked_futures_assets.iter().any(|a| a == asset)
    }

    pub fn is_tracked_lending(&self, asset: &str) -> bool {
        let mapped = self.lending_symbol(asset);
        self.tracked_lending_assets.iter().any(|a| *a == mapped)
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_str(key, default)
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_num_list<T: std::str::FromStr + Copy>(key: &str, default: &[T]) -> Vec<T> {
    match env::var(key) {
        Ok(raw) => {
            let parsed: Vec<T> = raw
                .split(',')
                .filter_map(|s| s.trim().parse::<T>().ok())
                .collect();
            if parsed.is_empty() {
                default.to_vec()
            } else {
                parsed
            }
        }
        Err(_) => default.to_vec(),
    }
}

/// Parse `ASSET:value,ASSET:value` overrides, falling back to defaults per asset.
fn env_asset_map(key: &str, defaults: &[(&str, f64)]) -> HashMap<String, f64> {
    let mut map: HashMap<String, f64> = defaults
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();

    if let Ok(raw) = env::var(key) {
        for entry in raw.split(',') {
            if let Some((asset, value)) = entry.split_once(':') {
                if let Ok(v) = value.trim().parse::<f64>() {
                    map.insert(asset.trim().to_uppercase(), v);
                }
            }
        }
    }

    map
}

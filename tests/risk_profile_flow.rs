//! End-to-end risk profile scenarios against a seeded in-memory store.

use chrono::{DateTime, Duration, Utc};
use riskfolio_backend::{
    analysis::riskprofile::{calculate_risk_profile, RiskProfileRequest},
    config::Config,
    models::{BorrowType, FuturesKline, LendingRow, OhlcvCandle, Position, PositionType},
    storage::Database,
};

fn day(n: i64) -> DateTime<Utc> {
    // Align seeded rows on day boundaries inside the lookback window.
    let today = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    today - Duration::days(n)
}

fn seed_spot_closes(db: &Database, asset: &str, closes: &[f64]) {
    let n = closes.len() as i64;
    let candles: Vec<OhlcvCandle> = closes
        .iter()
        .enumerate()
        .map(|(i, close)| OhlcvCandle {
            timestamp: day(n - i as i64),
            open: *close,
            high: *close,
            low: *close,
            close: *close,
            volume: 10.0,
            filled: false,
        })
        .collect();
    db.upsert_ohlcv_batch(asset, &candles).unwrap();
}

fn spot_position(asset: &str, qty: f64, entry: f64) -> Position {
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

#[tokio::test]
async fn pure_spot_valuation_and_sensitivity() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    // Ten days of history ending at exactly 50,000.
    seed_spot_closes(
        &db,
        "BTC",
        &[
            47_000.0, 48_000.0, 46_500.0, 49_000.0, 50_500.0, 49_500.0, 51_000.0, 50_200.0,
            49_800.0, 50_000.0,
        ],
    );

    let request = RiskProfileRequest {
        positions: vec![spot_position("BTC", 1.0, 40_000.0)],
        lookback_days: Some(30),
    };
    let profile = calculate_risk_profile(&db, &config, request).await.unwrap();

    assert!((profile.current_portfolio_value - 50_000.0).abs() < 1e-6);
    assert!((profile.risk_metrics.delta_exposure - 1.0).abs() < 1e-12);

    let by_shock = |pct: f64| {
        profile
            .sensitivity_analysis
            .iter()
            .find(|p| (p.price_change_pct - pct).abs() < 1e-9)
            .expect("shock point present")
    };
    assert!((by_shock(0.0).portfolio_value - 50_000.0).abs() < 1e-6);
    assert!((by_shock(10.0).portfolio_value - 55_000.0).abs() < 1e-6);
    assert!((by_shock(-10.0).portfolio_value - 45_000.0).abs() < 1e-6);

    // Flash crash scenario is exactly -20%.
    let crash = &profile.scenarios["flash_crash"];
    assert!((crash.return_pct + 20.0).abs() < 1e-9);
    assert!((crash.portfolio_value - 40_000.0).abs() < 1e-6);

    // VaR ordering on the historical sample.
    let rm = &profile.risk_metrics;
    assert!(rm.var_99_1day <= rm.var_95_1day);
    assert!(rm.var_95_1day <= 0.0);

    // Correlation matrix over a single asset: unit diagonal.
    assert!((rm.correlation_matrix["BTC"]["BTC"] - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn futures_leverage_separates_margin_from_pnl() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    let marks: Vec<FuturesKline> = (0..10)
        .map(|i| FuturesKline {
            timestamp: day(10 - i),
            open: 2_000.0,
            high: 2_250.0,
            low: 1_950.0,
            close: if i == 9 { 2_200.0 } else { 2_000.0 + 20.0 * i as f64 },
        })
        .collect();
    db.upsert_klines_batch(
        riskfolio_backend::models::Metric::FutMarkKlines,
        "ETH",
        &marks,
    )
    .unwrap();

    let request = RiskProfileRequest {
        positions: vec![Position {
            asset: "ETH".to_string(),
            quantity: 10.0,
            position_type: PositionType::FuturesLong,
            entry_price: Some(2_000.0),
            leverage: Some(5.0),
            entry_timestamp: None,
            entry_index: None,
            borrow_type: None,
        }],
        lookback_days: Some(30),
    };
    let profile = calculate_risk_profile(&db, &config, request).await.unwrap();

    // margin 10*2000/5 = 4000, pnl (2200-2000)*10 = 2000.
    assert!((profile.current_portfolio_value - 6_000.0).abs() < 1e-6);
    // Leverage must not appear in delta.
    assert!((profile.risk_metrics.delta_exposure - 10.0).abs() < 1e-12);
}

#[tokio::test]
async fn futures_with_long_lookback_warns_about_coverage() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    let marks: Vec<FuturesKline> = (0..5)
        .map(|i| FuturesKline {
            timestamp: day(5 - i),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0 + i as f64,
        })
        .collect();
    db.upsert_klines_batch(
        riskfolio_backend::models::Metric::FutMarkKlines,
        "BTC",
        &marks,
    )
    .unwrap();

    let request = RiskProfileRequest {
        positions: vec![Position {
            asset: "BTC".to_string(),
            quantity: 1.0,
            position_type: PositionType::FuturesShort,
            entry_price: Some(100.0),
            leverage: Some(2.0),
            entry_timestamp: None,
            entry_index: None,
            borrow_type: None,
        }],
        lookback_days: Some(90),
    };
    let profile = calculate_risk_profile(&db, &config, request).await.unwrap();

    let warning = profile
        .data_availability_warning
        .expect("coverage warning expected");
    assert!(warning.contains("funding/mark coverage"), "got: {warning}");
    // The engine still returns metrics.
    assert!(profile.current_portfolio_value.is_finite());
}

fn flat_lending_row(ts: DateTime<Utc>, liquidity_index: &str) -> LendingRow {
    LendingRow {
        timestamp: ts,
        // 2% supply, 4% variable borrow in RAY.
        supply_rate_ray: "20000000000000000000000000".to_string(),
        var_borrow_rate_ray: "40000000000000000000000000".to_string(),
        stable_borrow_rate_ray: "50000000000000000000000000".to_string(),
        liquidity_index: liquidity_index.to_string(),
        variable_borrow_index: "1000000000000000000000000000".to_string(),
    }
}

#[tokio::test]
async fn lending_supply_accrues_with_the_index() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    // Index grows 1.00 -> 1.05 RAY over the window.
    let rows: Vec<LendingRow> = (0..6)
        .map(|i| {
            let idx = format!("10{}0000000000000000000000000", i);
            flat_lending_row(day(6 - i), &idx)
        })
        .collect();
    db.upsert_lending_batch("WETH", &rows).unwrap();

    let request = RiskProfileRequest {
        positions: vec![Position {
            asset: "WETH".to_string(),
            quantity: 10.0,
            position_type: PositionType::LendingSupply,
            entry_price: None,
            leverage: None,
            entry_timestamp: Some(day(6)),
            entry_index: None,
            borrow_type: None,
        }],
        lookback_days: Some(30),
    };
    let profile = calculate_risk_profile(&db, &config, request).await.unwrap();

    // 10 * 1.05 / 1.00 = 10.5 WETH.
    assert!(
        (profile.current_portfolio_value - 10.5).abs() < 1e-9,
        "value = {}",
        profile.current_portfolio_value
    );

    let lending = profile.risk_metrics.lending_metrics.expect("lending metrics");
    assert!((lending.total_supplied_value - 10.5).abs() < 1e-9);
    assert_eq!(lending.total_borrowed_value, 0.0);
    // No debt: health factor is infinite (null).
    assert!(lending.health_factor.is_none());
    assert_eq!(lending.current_ltv, 0.0);
}

#[tokio::test]
async fn health_factor_borderline_account() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    // Flat indices at 1.0 RAY so values equal quantities.
    for asset in ["WETH", "USDC"] {
        let rows: Vec<LendingRow> = (0..6)
            .map(|i| flat_lending_row(day(6 - i), "1000000000000000000000000000"))
            .collect();
        db.upsert_lending_batch(asset, &rows).unwrap();
    }

    let request = RiskProfileRequest {
        positions: vec![
            Position {
                asset: "WETH".to_string(),
                quantity: 10_000.0,
                position_type: PositionType::LendingSupply,
                entry_price: None,
                leverage: None,
                entry_timestamp: Some(day(6)),
                entry_index: None,
                borrow_type: None,
            },
            Position {
                asset: "USDC".to_string(),
                quantity: 7_500.0,
                position_type: PositionType::LendingBorrow,
                entry_price: None,
                leverage: None,
                entry_timestamp: Some(day(6)),
                entry_index: None,
                borrow_type: Some(BorrowType::Variable),
            },
        ],
        lookback_days: Some(30),
    };
    let profile = calculate_risk_profile(&db, &config, request).await.unwrap();

    let lending = profile.risk_metrics.lending_metrics.expect("lending metrics");
    assert!((lending.total_supplied_value - 10_000.0).abs() < 1e-6);
    assert!((lending.total_borrowed_value - 7_500.0).abs() < 1e-6);

    // LTV = 7500/10000, HF = 10000*0.825/7500 = 1.10,
    // max safe borrow = 10000*0.80 - 7500 = 500.
    assert!((lending.current_ltv - 0.75).abs() < 1e-9);
    assert!((lending.health_factor.unwrap() - 1.10).abs() < 1e-9);
    assert!((lending.max_safe_borrow - 500.0).abs() < 1e-6);

    // Net APY uses value-weighted rates; supply 2% APR vs borrow 4% APR on
    // smaller principal keeps it finite and signed sensibly.
    assert!(lending.net_apy.is_finite());
    assert!(lending.weighted_borrow_apy > lending.weighted_supply_apy);
}

#[tokio::test]
async fn alt_season_scenario_is_value_weighted() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    seed_spot_closes(&db, "BTC", &[49_000.0, 49_500.0, 50_000.0]);
    seed_spot_closes(&db, "ETH", &[2_900.0, 2_950.0, 3_000.0]);

    let request = RiskProfileRequest {
        positions: vec![
            spot_position("BTC", 1.0, 45_000.0),
            spot_position("ETH", 10.0, 2_500.0),
        ],
        lookback_days: Some(30),
    };
    let profile = calculate_risk_profile(&db, &config, request).await.unwrap();

    let alt = &profile.scenarios["alt_season"];
    let expected = 50_000.0 * 1.20 + 30_000.0 * 1.50;
    assert!((alt.portfolio_value - expected).abs() < 1e-6);

    // Identical-shaped histories: correlation matrix stays symmetric with a
    // unit diagonal.
    let corr = &profile.risk_metrics.correlation_matrix;
    assert!((corr["BTC"]["BTC"] - 1.0).abs() < 1e-9);
    assert!((corr["BTC"]["ETH"] - corr["ETH"]["BTC"]).abs() < 1e-12);
    assert!(corr["BTC"]["ETH"] <= 1.0 + 1e-12);
}

#[tokio::test]
async fn boundary_validation_rejections() {
    let db = Database::open_in_memory().unwrap();
    let config = Config::from_env();

    // Empty portfolio.
    let empty = RiskProfileRequest {
        positions: vec![],
        lookback_days: Some(30),
    };
    assert!(calculate_risk_profile(&db, &config, empty).await.is_err());

    // 21 positions.
    let too_many = RiskProfileRequest {
        positions: (0..21).map(|_| spot_position("BTC", 1.0, 100.0)).collect(),
        lookback_days: Some(30),
    };
    assert!(calculate_risk_profile(&db, &config, too_many).await.is_err());

    // Lookback outside 7..=180.
    for days in [6, 181] {
        let bad = RiskProfileRequest {
            positions: vec![spot_position("BTC", 1.0, 100.0)],
            lookback_days: Some(days),
        };
        assert!(calculate_risk_profile(&db, &config, bad).await.is_err());
    }
}

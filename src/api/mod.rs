//! HTTP API: application state and the `/api/v1` router.

pub mod routes;

use crate::config::Config;
use crate::fetch::spot::SpotFetcher;
use crate::storage::Database;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub spot: Arc<SpotFetcher>,
}

/// Build the full application router (service info at `/`, API under
/// `/api/v1`).
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(routes::health))
        .route("/assets", get(routes::spot_assets))
        .route("/ohlcv/:asset", get(routes::ohlcv))
        .route("/futures/assets", get(routes::futures_assets))
        .route("/futures/funding-rates/:asset", get(routes::funding_rates))
        .route("/futures/mark-price/:asset", get(routes::mark_price))
        .route("/futures/index-price/:asset", get(routes::index_price))
        .route("/futures/open-interest/:asset", get(routes::open_interest))
        .route("/lending/assets", get(routes::lending_assets))
        .route("/lending/:asset", get(routes::lending))
        // `multi` must be registered before the `{asset}` capture.
        .route("/aggregated-stats/multi", get(routes::aggregated_stats_multi))
        .route("/aggregated-stats/:asset", get(routes::aggregated_stats_single))
        .route("/analysis/risk-profile", post(routes::risk_profile))
        .route("/fetch/trigger", post(routes::fetch_trigger));

    Router::new()
        .route("/", get(routes::service_info))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

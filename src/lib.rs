//! Crypto portfolio risk backend: market-data ingestion (Binance spot &
//! futures, Aave lending via Dune) plus aggregated-stats and risk-profile
//! analytics over the stored history.

pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod fetch;
pub mod models;
pub mod scheduler;
pub mod storage;

//! Rate-limited Binance REST adapter (spot + USD-M futures).
//!
//! The only place that knows Binance page sizes, pagination cursors, and
//! retry semantics. Never touches storage.

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::models::{FundingRateRow, FuturesKline, OhlcvCandle, OpenInterestRow};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const KLINES_PAGE: usize = 1000;
const FUTURES_KLINES_PAGE: usize = 1500;
const FUNDING_PAGE: usize = 1000;
const OPEN_INTEREST_PAGE: usize = 500;
/// Fallback pause when a 429 carries no Retry-After header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Token bucket (per-minute refill) + minimum inter-request delay + bounded
/// concurrency. One instance per provider; a 429 pause affects only the task
/// that hit it while the semaphore keeps total in-flight requests capped.
struct RateLimiter {
    semaphore: Semaphore,
    state: Mutex<LimiterState>,
    requests_per_minute: u32,
    min_delay: Duration,
}

struct LimiterState {
    last_request: Option<Instant>,
    window_start: Instant,
    used_in_window: u32,
}

impl RateLimiter {
    fn new(requests_per_minute: u32, request_delay_ms: u64) -> Self {
        Self {
            semaphore: Semaphore::new(10),
            state: Mutex::new(LimiterState {
                last_request: None,
                window_start: Instant::now(),
                used_in_window: 0,
            }),
            requests_per_minute: requests_per_minute.max(1),
            min_delay: Duration::from_millis(request_delay_ms),
        }
    }

    async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("rate limiter semaphore closed");

        let mut state = self.state.lock().await;

        // Refill the per-minute bucket.
        if state.window_start.elapsed() >= Duration::from_secs(60) {
            state.window_start = Instant::now();
            state.used_in_window = 0;
        }

        if state.used_in_window >= self.requests_per_minute {
            let wait = Duration::from_secs(60).saturating_sub(state.window_start.elapsed());
            if !wait.is_zero() {
                debug!("Rate limit window exhausted, waiting {}ms", wait.as_millis());
                sleep(wait).await;
            }
            state.window_start = Instant::now();
            state.used_in_window = 0;
        }

        if let Some(last) = state.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                sleep(self.min_delay - elapsed).await;
            }
        }

        state.last_request = Some(Instant::now());
        state.used_in_window += 1;
        permit
    }
}

pub struct BinanceClient {
    client: reqwest::Client,
    spot_base: String,
    futures_base: String,
    limiter: RateLimiter,
}

impl BinanceClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ServiceError::ProviderPermanent(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            spot_base: config.binance_api_base_url.clone(),
            futures_base: config.binance_futures_api_base_url.clone(),
            limiter: RateLimiter::new(
                config.binance_rate_limit_requests_per_minute,
                config.binance_request_delay_ms,
            ),
        })
    }

    /// GET with retry: 429 honours Retry-After, 5xx and network errors back
    /// off 1s/2s/4s, other 4xx fail fast.
    async fn request_with_retry(&self, url: &str, params: &[(String, String)]) -> Result<Value> {
        let mut last_err = ServiceError::ProviderTransient("no attempts made".into());

        for attempt in 0..MAX_RETRIES {
            let _permit = self.limiter.acquire().await;

            match self.client.get(url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Value>().await.map_err(|e| {
                            ServiceError::ProviderPermanent(format!("invalid JSON from {url}: {e}"))
                        });
                    }

                    if status.as_u16() == 429 {
                        let retry_after = resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                        warn!(
                            "Rate limit exceeded on {url}, waiting {retry_after}s before retry"
                        );
                        last_err =
                            ServiceError::ProviderTransient(format!("429 from {url}"));
                        sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        warn!(
                            "Server error {status} from {url} (attempt {}/{MAX_RETRIES})",
                            attempt + 1
                        );
                        last_err = ServiceError::ProviderTransient(format!(
                            "{status} from {url}: {body}"
                        ));
                    } else {
                        // Client errors other than 429 are never retried.
                        return Err(ServiceError::ProviderPermanent(format!(
                            "{status} from {url}: {body}"
                        )));
                    }
                }
                Err(e) => {
                    warn!("Request error on {url} (attempt {}): {e}", attempt + 1);
                    last_err = ServiceError::ProviderTransient(e.to_string());
                }
            }

            if attempt < MAX_RETRIES - 1 {
                let backoff = Duration::from_secs(1 << attempt);
                debug!("Retrying {url} in {}s", backoff.as_secs());
                sleep(backoff).await;
            }
        }

        Err(last_err)
    }

    // ==================== spot klines ====================

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawKline>> {
        let url = format!("{}/api/v3/klines", self.spot_base);
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("limit".to_string(), limit.min(KLINES_PAGE).to_string()),
        ];
        push_window_ms(&mut params, start, end);

        let data = self.request_with_retry(&url, &params).await?;
        parse_kline_array(&data, symbol)
    }

    /// Fetch spot klines across the 1000-candle page limit. Cursor: last
    /// candle's close time + 1ms.
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OhlcvCandle>> {
        let mut all: Vec<RawKline> = Vec::new();
        let mut cursor = start;

        loop {
            let batch = self
                .get_klines(symbol, interval, cursor, end, KLINES_PAGE)
                .await?;
            if batch.is_empty() {
                break;
            }
            let full_page = batch.len() >= KLINES_PAGE;
            let last_close_ms = batch.last().map(|k| k.close_time_ms).unwrap_or_default();
            all.extend(batch);
            if !full_page {
                break;
            }
            let next = ms_to_utc(last_close_ms + 1);
            if end.map(|e| next >= e).unwrap_or(false) {
                break;
            }
            cursor = Some(next);
        }

        debug!("Fetched {} klines for {symbol} (paginated)", all.len());
        Ok(normalize_by_timestamp(
            all.into_iter().map(|k| k.into_candle()).collect(),
            |c: &OhlcvCandle| c.timestamp,
        ))
    }

    // ==================== futures: funding ====================

    pub async fn get_funding_rate_history_paginated(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingRateRow>> {
        let url = format!("{}/fapi/v1/fundingRate", self.futures_base);
        let mut all: Vec<RawFundingRate> = Vec::new();
        let mut cursor = start;

        loop {
            let mut params = vec![
                ("symbol".to_string(), symbol.to_string()),
                ("limit".to_string(), FUNDING_PAGE.to_string()),
            ];
            push_window_ms(&mut params, cursor, end);

            let data = self.request_with_retry(&url, &params).await?;
            let batch: Vec<RawFundingRate> = serde_json::from_value(data).map_err(|e| {
                ServiceError::ProviderPermanent(format!("funding rate schema mismatch: {e}"))
            })?;
            if batch.is_empty() {
                break;
            }
            let full_page = batch.len() >= FUNDING_PAGE;
            let last_ms = batch.last().map(|r| r.funding_time).unwrap_or_default();
            all.extend(batch);
            if !full_page {
                break;
            }
            let next = ms_to_utc(last_ms + 1);
            if end.map(|e| next >= e).unwrap_or(false) {
                break;
            }
            cursor = Some(next);
        }

        debug!("Fetched {} funding rates for {symbol} (paginated)", all.len());
        let rows = all
            .into_iter()
            .filter_map(|r| r.into_row())
            .collect::<Vec<_>>();
        Ok(normalize_by_timestamp(rows, |r: &FundingRateRow| r.timestamp))
    }

    // ==================== futures: mark / index klines ====================

    pub async fn get_mark_price_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FuturesKline>> {
        let url = format!("{}/fapi/v1/markPriceKlines", self.futures_base);
        self.get_futures_klines_paginated(&url, "symbol", symbol, interval, start, end)
            .await
    }

    /// Index-price endpoint takes `pair` instead of `symbol`.
    pub async fn get_index_price_klines_paginated(
        &self,
        pair: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FuturesKline>> {
        let url = format!("{}/fapi/v1/indexPriceKlines", self.futures_base);
        self.get_futures_klines_paginated(&url, "pair", pair, interval, start, end)
            .await
    }

    async fn get_futures_klines_paginated(
        &self,
        url: &str,
        symbol_param: &str,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FuturesKline>> {
        let mut all: Vec<RawKline> = Vec::new();
        let mut cursor = start;

        loop {
            let mut params = vec![
                (symbol_param.to_string(), symbol.to_string()),
                ("interval".to_string(), interval.to_string()),
                ("limit".to_string(), FUTURES_KLINES_PAGE.to_string()),
            ];
            push_window_ms(&mut params, cursor, end);

            let data = self.request_with_retry(url, &params).await?;
            let batch = parse_kline_array(&data, symbol)?;
            if batch.is_empty() {
                break;
            }
            let full_page = batch.len() >= FUTURES_KLINES_PAGE;
            let last_close_ms = batch.last().map(|k| k.close_time_ms).unwrap_or_default();
            all.extend(batch);
            if !full_page {
                break;
            }
            let next = ms_to_utc(last_close_ms + 1);
            if end.map(|e| next >= e).unwrap_or(false) {
                break;
            }
            cursor = Some(next);
        }

        Ok(normalize_by_timestamp(
            all.into_iter().map(|k| k.into_futures_kline()).collect(),
            |k: &FuturesKline| k.timestamp,
        ))
    }

    // ==================== futures: open interest ====================

    /// Open interest history. Binance retains only ~30 days; requests past
    /// retention simply return empty pages.
    pub async fn get_open_interest_history_paginated(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OpenInterestRow>> {
        let url = format!("{}/futures/data/openInterestHist", self.futures_base);
        let mut all: Vec<RawOpenInterest> = Vec::new();
        let mut cursor = start;

        loop {
            let mut params = vec![
                ("symbol".to_string(), symbol.to_string()),
                ("period".to_string(), period.to_string()),
                ("limit".to_string(), OPEN_INTEREST_PAGE.to_string()),
            ];
            push_window_ms(&mut params, cursor, end);

            let data = self.request_with_retry(&url, &params).await?;
            let batch: Vec<RawOpenInterest> = serde_json::from_value(data).map_err(|e| {
                ServiceError::ProviderPermanent(format!("open interest schema mismatch: {e}"))
            })?;
            if batch.is_empty() {
                break;
            }
            let full_page = batch.len() >= OPEN_INTEREST_PAGE;
            let last_ms = batch.last().map(|r| r.timestamp).unwrap_or_default();
            all.extend(batch);
            if !full_page {
                break;
            }
            let next = ms_to_utc(last_ms + 1);
            if end.map(|e| next >= e).unwrap_or(false) {
                break;
            }
            cursor = Some(next);
        }

        let rows = all
            .into_iter()
            .filter_map(|r| r.into_row())
            .collect::<Vec<_>>();
        Ok(normalize_by_timestamp(rows, |r: &OpenInterestRow| {
            r.timestamp
        }))
    }
}

// ==================== raw wire shapes ====================

/// One kline from the array-of-arrays wire format.
#[derive(Debug, Clone)]
pub struct RawKline {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time_ms: i64,
}

impl RawKline {
    pub fn from_value(item: &Value) -> Result<Self> {
        let arr = item.as_array().ok_or_else(|| {
            ServiceError::ProviderPermanent("kline entry is not an array".into())
        })?;
        if arr.len() < 7 {
            return Err(ServiceError::ProviderPermanent(format!(
                "invalid kline: expected >= 7 fields, got {}",
                arr.len()
            )));
        }
        Ok(Self {
            open_time_ms: value_as_i64(&arr[0])?,
            open: value_as_f64(&arr[1])?,
            high: value_as_f64(&arr[2])?,
            low: value_as_f64(&arr[3])?,
            close: value_as_f64(&arr[4])?,
            volume: value_as_f64(&arr[5])?,
            close_time_ms: value_as_i64(&arr[6])?,
        })
    }

    pub fn into_candle(self) -> OhlcvCandle {
        OhlcvCandle {
            timestamp: ms_to_utc(self.open_time_ms),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            filled: false,
        }
    }

    pub fn into_futures_kline(self) -> FuturesKline {
        FuturesKline {
            timestamp: ms_to_utc(self.open_time_ms),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFundingRate {
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "markPrice", default)]
    mark_price: Option<String>,
}

impl RawFundingRate {
    fn into_row(self) -> Option<FundingRateRow> {
        Some(FundingRateRow {
            timestamp: ms_to_utc(self.funding_time),
            funding_rate: self.funding_rate.trim().parse().ok()?,
            mark_price: self.mark_price.and_then(|m| m.trim().parse().ok()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawOpenInterest {
    #[serde(rename = "sumOpenInterest")]
    sum_open_interest: String,
    timestamp: i64,
}

impl RawOpenInterest {
    fn into_row(self) -> Option<OpenInterestRow> {
        Some(OpenInterestRow {
            timestamp: ms_to_utc(self.timestamp),
            open_interest: self.sum_open_interest.trim().parse().ok()?,
        })
    }
}

// ==================== helpers ====================

fn parse_kline_array(data: &Value, symbol: &str) -> Result<Vec<RawKline>> {
    let arr = data.as_array().ok_or_else(|| {
        ServiceError::ProviderPermanent(format!(
            "unexpected kline response for {symbol}: expected array"
        ))
    })?;
    arr.iter().map(RawKline::from_value).collect()
}

fn push_window_ms(
    params: &mut Vec<(String, String)>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) {
    if let Some(s) = start {
        params.push(("startTime".to_string(), s.timestamp_millis().to_string()));
    }
    if let Some(e) = end {
        params.push(("endTime".to_string(), e.timestamp_millis().to_string()));
    }
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn value_as_f64(v: &Value) -> Result<f64> {
    match v {
        Value::String(s) => s.trim().parse::<f64>().map_err(|e| {
            ServiceError::ProviderPermanent(format!("bad decimal string {s:?}: {e}"))
        }),
        Value::Number(n) => n.as_f64().ok_or_else(|| {
            ServiceError::ProviderPermanent(format!("non-finite number: {n}"))
        }),
        other => Err(ServiceError::ProviderPermanent(format!(
            "expected number, got {other}"
        ))),
    }
}

fn value_as_i64(v: &Value) -> Result<i64> {
    v.as_i64().ok_or_else(|| {
        ServiceError::ProviderPermanent(format!("expected integer, got {v}"))
    })
}

/// Sort ascending by timestamp and drop duplicate grid points, keeping the
/// last occurrence (pages can overlap at the cursor boundary).
fn normalize_by_timestamp<T, F>(mut rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    rows.sort_by_key(|r| key(r));
    rows.reverse();
    let mut seen = std::collections::HashSet::new();
    rows.retain(|r| seen.insert(key(r)));
    rows.reverse();
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kline_wire_format() {
        let raw = serde_json::json!([
            1700000000000i64,
            "37000.5",
            "37100.0",
            "36900.0",
            "37050.25",
            "1234.5",
            1700043199999i64,
            "45000000.0",
            4321,
            "600.0",
            "22000000.0",
            "0"
        ]);
        let k = RawKline::from_value(&raw).unwrap();
        assert_eq!(k.open_time_ms, 1_700_000_000_000);
        assert_eq!(k.close, 37_050.25);

        let candle = k.into_candle();
        assert_eq!(candle.timestamp, ms_to_utc(1_700_000_000_000));
        assert_eq!(candle.timestamp.timezone(), Utc);
        assert!(!candle.filled);
    }

    #[test]
    fn rejects_malformed_kline() {
        let raw = serde_json::json!([1700000000000i64, "37000.5"]);
        assert!(RawKline::from_value(&raw).is_err());

        let not_array = serde_json::json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(parse_kline_array(&not_array, "NOPEUSDT").is_err());
    }

    #[test]
    fn parses_funding_rate_rows() {
        let raw = serde_json::json!([
            {"symbol": "BTCUSDT", "fundingTime": 1700000000000i64, "fundingRate": "0.00010000", "markPrice": "37000.1"},
            {"symbol": "BTCUSDT", "fundingTime": 1700028800000i64, "fundingRate": "-0.00005000"}
        ]);
        let rows: Vec<RawFundingRate> = serde_json::from_value(raw).unwrap();
        let rows: Vec<FundingRateRow> = rows.into_iter().filter_map(|r| r.into_row()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].funding_rate, 0.0001);
        assert_eq!(rows[0].mark_price, Some(37_000.1));
        assert_eq!(rows[1].mark_price, None);
    }

    #[test]
    fn normalize_sorts_and_dedupes() {
        let mk = |ms: i64, rate: f64| FundingRateRow {
            timestamp: ms_to_utc(ms),
            funding_rate: rate,
            mark_price: None,
        };
        // Out of order with a duplicated timestamp; later occurrence wins.
        let rows = vec![mk(2000, 0.2), mk(1000, 0.1), mk(2000, 0.3)];
        let out = normalize_by_timestamp(rows, |r| r.timestamp);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, ms_to_utc(1000));
        assert_eq!(out[1].funding_rate, 0.3);
    }
}

//! Dune Analytics query executor adapter for Aave lending snapshots.
//!
//! Executes the configured lending query (execute -> poll status -> fetch
//! results). One execution returns daily snapshots for every tracked reserve,
//! so the per-asset fetchers share a single call.

use crate::config::Config;
use crate::error::{Result, ServiceError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const DUNE_API_BASE: &str = "https://api.dune.com/api/v1";
const MAX_RETRIES: u32 = 3;
/// Free-tier allowance is ~1 execution per minute; 65s keeps a margin.
const MIN_EXECUTION_INTERVAL: Duration = Duration::from_secs(65);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// One reserve-day snapshot as returned by the lending query.
#[derive(Debug, Clone)]
pub struct DuneLendingRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub reserve: String,
    pub supply_rate_ray: String,
    pub var_borrow_rate_ray: String,
    pub stable_borrow_rate_ray: String,
    pub liquidity_index: String,
    pub variable_borrow_index: String,
}

pub struct DuneClient {
    client: reqwest::Client,
    api_key: String,
    query_id: u64,
    base_url: String,
    last_execution: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    execution_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: String,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    result: Option<ResultBody>,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    rows: Vec<Value>,
}

impl DuneClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.dune_api_key.clone().ok_or_else(|| {
            ServiceError::ProviderPermanent("DUNE_API_KEY not configured".into())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::ProviderPermanent(format!("failed to build client: {e}")))?;

        info!("Dune client initialized (query {})", config.dune_lending_query_id);

        Ok(Self {
            client,
            api_key,
            query_id: config.dune_lending_query_id,
            base_url: DUNE_API_BASE.to_string(),
            last_execution: Mutex::new(None),
        })
    }

    async fn rate_limit(&self) {
        let mut last = self.last_execution.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_EXECUTION_INTERVAL {
                let wait = MIN_EXECUTION_INTERVAL - elapsed;
                info!("Dune rate limiting: sleeping {:.1}s", wait.as_secs_f64());
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Run the lending query and parse its rows. Retries the whole
    /// execute/poll/results flow with 5s/10s/20s backoff.
    pub async fn get_lending_data(&self) -> Result<Vec<DuneLendingRecord>> {
        let mut last_err = ServiceError::ProviderTransient("no attempts made".into());

        for attempt in 0..MAX_RETRIES {
            self.rate_limit().await;

            match self.execute_and_collect().await {
                Ok(rows) => {
                    let mut records = Vec::with_capacity(rows.len());
                    for row in &rows {
                        match parse_lending_row(row) {
                            Some(rec) => records.push(rec),
                            None => warn!("Failed to parse Dune row: {row}"),
                        }
                    }
                    info!(
                        "Dune query {} returned {} rows ({} parsed)",
                        self.query_id,
                        rows.len(),
                        records.len()
                    );
                    return Ok(records);
                }
                Err(e) => {
                    warn!(
                        "Dune attempt {}/{MAX_RETRIES} failed: {e}",
                        attempt + 1
                    );
                    last_err = e;
                    if attempt < MAX_RETRIES - 1 {
                        let backoff = Duration::from_secs(5 * (1 << attempt));
                        debug!("Retrying Dune query in {}s", backoff.as_secs());
                        sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    async fn execute_and_collect(&self) -> Result<Vec<Value>> {
        let execute_url = format!("{}/query/{}/execute", self.base_url, self.query_id);
        let resp = self
            .client
            .post(&execute_url)
            .header("X-Dune-API-Key", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &execute_url, &body));
        }
        let execution: ExecuteResponse = resp.json().await.map_err(|e| {
            ServiceError::ProviderPermanent(format!("bad execute response: {e}"))
        })?;

        // Poll until the execution settles.
        let deadline = Instant::now() + EXECUTION_TIMEOUT;
        let status_url = format!(
            "{}/execution/{}/status",
            self.base_url, execution.execution_id
        );
        loop {
            if Instant::now() > deadline {
                return Err(ServiceError::ProviderTransient(format!(
                    "Dune execution {} timed out",
                    execution.execution_id
                )));
            }

            let resp = self
                .client
                .get(&status_url)
                .header("X-Dune-API-Key", &self.api_key)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, &status_url, &body));
            }
            let status: StatusResponse = resp.json().await.map_err(|e| {
                ServiceError::ProviderPermanent(format!("bad status response: {e}"))
            })?;

            match status.state.as_str() {
                "QUERY_STATE_COMPLETED" => break,
                "QUERY_STATE_FAILED" | "QUERY_STATE_CANCELLED" => {
                    return Err(ServiceError::ProviderPermanent(format!(
                        "Dune execution ended in state {}",
                        status.state
                    )))
                }
                _ => sleep(POLL_INTERVAL).await,
            }
        }

        let results_url = format!(
            "{}/execution/{}/results",
            self.base_url, execution.execution_id
        );
        let resp = self
            .client
            .get(&results_url)
            .header("X-Dune-API-Key", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &results_url, &body));
        }
        let results: ResultsResponse = resp.json().await.map_err(|e| {
            ServiceError::ProviderPermanent(format!("bad results response: {e}"))
        })?;

        Ok(results.result.map(|r| r.rows).unwrap_or_default())
    }
}

fn classify_status(status: reqwest::StatusCode, url: &str, body: &str) -> ServiceError {
    if status.is_server_error() || status.as_u16() == 429 {
        ServiceError::ProviderTransient(format!("{status} from {url}: {body}"))
    } else {
        ServiceError::ProviderPermanent(format!("{status} from {url}: {body}"))
    }
}

/// Parse one result row. The query exposes `dt`, `symbol`, `reserve` and the
/// RAY-scaled averages; numeric cells may arrive as strings or numbers.
fn parse_lending_row(row: &Value) -> Option<DuneLendingRecord> {
    let timestamp = parse_dt(row.get("dt")?)?;
    Some(DuneLendingRecord {
        timestamp,
        symbol: row.get("symbol")?.as_str()?.to_uppercase(),
        reserve: row.get("reserve")?.as_str()?.to_string(),
        supply_rate_ray: decimal_string(row.get("avg_supplyRate")?)?,
        var_borrow_rate_ray: decimal_string(row.get("avg_variableBorrowRate")?)?,
        stable_borrow_rate_ray: decimal_string(row.get("avg_stableBorrowRate")?)?,
        liquidity_index: decimal_string(row.get("avg_liquidityIndex")?)?,
        variable_borrow_index: decimal_string(row.get("avg_variableBorrowIndex")?)?,
    })
}

fn parse_dt(v: &Value) -> Option<DateTime<Utc>> {
    let raw = v.as_str()?;
    // Timestamps arrive either as full RFC 3339 instants or bare dates.
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTimeParse::parse(raw) {
        return Some(ts);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// `YYYY-MM-DD HH:MM:SS[.fff] [UTC]` shapes Dune emits.
struct NaiveDateTimeParse;

impl NaiveDateTimeParse {
    fn parse(raw: &str) -> std::result::Result<DateTime<Utc>, ()> {
        let cleaned = raw.trim().trim_end_matches(" UTC");
        for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(cleaned, fmt) {
                return Ok(dt.and_utc());
            }
        }
        Err(())
    }
}

fn decimal_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

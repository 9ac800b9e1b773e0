//! SQLite-backed time-series store.
//!
//! All series tables are keyed UNIQUE (asset, timestamp); every write is an
//! upsert so ingestion is idempotent. Multi-row writes run inside a single
//! transaction. Timestamps are stored as UTC epoch seconds.

use crate::error::{Result, ServiceError};
use crate::models::{
    BackfillState, FundingRateRow, FuturesKline, LendingRow, Metric, OhlcvCandle, OpenInterestRow,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS spot_ohlcv (
    asset TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_spot_ohlcv_asset_ts
    ON spot_ohlcv(asset, timestamp DESC);

CREATE TABLE IF NOT EXISTS fut_funding (
    asset TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    funding_rate REAL NOT NULL,
    mark_price REAL,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_fut_funding_asset_ts
    ON fut_funding(asset, timestamp DESC);

CREATE TABLE IF NOT EXISTS fut_mark_klines (
    asset TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_fut_mark_klines_asset_ts
    ON fut_mark_klines(asset, timestamp DESC);

CREATE TABLE IF NOT EXISTS fut_index_klines (
    asset TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_fut_index_klines_asset_ts
    ON fut_index_klines(asset, timestamp DESC);

CREATE TABLE IF NOT EXISTS fut_open_interest (
    asset TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open_interest REAL NOT NULL,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_fut_open_interest_asset_ts
    ON fut_open_interest(asset, timestamp DESC);

-- RAY columns are decimal strings: 27 fractional digits do not fit REAL.
CREATE TABLE IF NOT EXISTS lending (
    asset TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    supply_rate_ray TEXT NOT NULL,
    var_borrow_rate_ray TEXT NOT NULL,
    stable_borrow_rate_ray TEXT NOT NULL,
    liquidity_index TEXT NOT NULL,
    variable_borrow_index TEXT NOT NULL,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_lending_asset_ts
    ON lending(asset, timestamp DESC);

CREATE TABLE IF NOT EXISTS backfill_state (
    asset TEXT NOT NULL,
    metric TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    last_fetched_timestamp INTEGER,
    updated_at INTEGER NOT NULL,
    UNIQUE(asset, metric)
);
"#;

/// Handle to the SQLite store. Cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| ServiceError::Storage(format!("failed to open {db_path}: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Database initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn health_check(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|v| v == 1)
            .unwrap_or(false)
    }

    // ==================== spot ====================

    /// Upsert a candle batch; returns the number of newly inserted rows
    /// (re-running the same batch returns 0).
    pub fn upsert_ohlcv_batch(&self, asset: &str, candles: &[OhlcvCandle]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = count_rows(&tx, "spot_ohlcv", asset)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO spot_ohlcv (asset, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(asset, timestamp) DO UPDATE SET
                     open = excluded.open, high = excluded.high, low = excluded.low,
                     close = excluded.close, volume = excluded.volume",
            )?;
            for c in candles {
                stmt.execute(params![
                    asset,
                    c.timestamp.timestamp(),
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume
                ])?;
            }
        }
        let after = count_rows(&tx, "spot_ohlcv", asset)?;
        tx.commit()?;
        Ok((after - before) as usize)
    }

    pub fn get_ohlcv(
        &self,
        asset: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<OhlcvCandle>> {
        let conn = self.conn.lock();
        let (clause, bounds) = range_clause(start, end);
        let sql = format!(
            "SELECT timestamp, open, high, low, close, volume FROM spot_ohlcv
             WHERE asset = ?1{clause} ORDER BY timestamp ASC{}",
            limit_clause(limit)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(
                std::iter::once(rusqlite::types::Value::from(asset.to_string())).chain(bounds),
            ),
            |row| {
                Ok(OhlcvCandle {
                    timestamp: epoch_to_utc(row.get(0)?),
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    filled: false,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ==================== futures ====================

    pub fn upsert_funding_batch(&self, asset: &str, rows: &[FundingRateRow]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = count_rows(&tx, "fut_funding", asset)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fut_funding (asset, timestamp, funding_rate, mark_price)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(asset, timestamp) DO UPDATE SET
                     funding_rate = excluded.funding_rate, mark_price = excluded.mark_price",
            )?;
            for r in rows {
                stmt.execute(params![
                    asset,
                    r.timestamp.timestamp(),
                    r.funding_rate,
                    r.mark_price
                ])?;
            }
        }
        let after = count_rows(&tx, "fut_funding", asset)?;
        tx.commit()?;
        Ok((after - before) as usize)
    }

    pub fn get_funding_rates(
        &self,
        asset: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<FundingRateRow>> {
        let conn = self.conn.lock();
        let (clause, bounds) = range_clause(start, end);
        let sql = format!(
            "SELECT timestamp, funding_rate, mark_price FROM fut_funding
             WHERE asset = ?1{clause} ORDER BY timestamp ASC{}",
            limit_clause(limit)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(
                std::iter::once(rusqlite::types::Value::from(asset.to_string())).chain(bounds),
            ),
            |row| {
                Ok(FundingRateRow {
                    timestamp: epoch_to_utc(row.get(0)?),
                    funding_rate: row.get(1)?,
                    mark_price: row.get(2)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn upsert_klines_batch(
        &self,
        metric: Metric,
        asset: &str,
        rows: &[FuturesKline],
    ) -> Result<usize> {
        let table = match metric {
            Metric::FutMarkKlines => "fut_mark_klines",
            Metric::FutIndexKlines => "fut_index_klines",
            other => {
                return Err(ServiceError::Storage(format!(
                    "upsert_klines_batch called for non-kline metric {}",
                    other.as_str()
                )))
            }
        };
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = count_rows(&tx, table, asset)?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO {table} (asset, timestamp, open, high, low, close)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(asset, timestamp) DO UPDATE SET
                     open = excluded.open, high = excluded.high,
                     low = excluded.low, close = excluded.close"
            ))?;
            for r in rows {
                stmt.execute(params![
                    asset,
                    r.timestamp.timestamp(),
                    r.open,
                    r.high,
                    r.low,
                    r.close
                ])?;
            }
        }
        let after = count_rows(&tx, table, asset)?;
        tx.commit()?;
        Ok((after - before) as usize)
    }

    pub fn get_klines(
        &self,
        metric: Metric,
        asset: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<FuturesKline>> {
        let table = match metric {
            Metric::FutMarkKlines => "fut_mark_klines",
            Metric::FutIndexKlines => "fut_index_klines",
            other => {
                return Err(ServiceError::Storage(format!(
                    "get_klines called for non-kline metric {}",
                    other.as_str()
                )))
            }
        };
        let conn = self.conn.lock();
        let (clause, bounds) = range_clause(start, end);
        let sql = format!(
            "SELECT timestamp, open, high, low, close FROM {table}
             WHERE asset = ?1{clause} ORDER BY timestamp ASC{}",
            limit_clause(limit)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(
                std::iter::once(rusqlite::types::Value::from(asset.to_string())).chain(bounds),
            ),
            |row| {
                Ok(FuturesKline {
                    timestamp: epoch_to_utc(row.get(0)?),
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn upsert_open_interest_batch(
        &self,
        asset: &str,
        rows: &[OpenInterestRow],
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = count_rows(&tx, "fut_open_interest", asset)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fut_open_interest (asset, timestamp, open_interest)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(asset, timestamp) DO UPDATE SET
                     open_interest = excluded.open_interest",
            )?;
            for r in rows {
                stmt.execute(params![asset, r.timestamp.timestamp(), r.open_interest])?;
            }
        }
        let after = count_rows(&tx, "fut_open_interest", asset)?;
        tx.commit()?;
        Ok((after - before) as usize)
    }

    pub fn get_open_interest(
        &self,
        asset: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<OpenInterestRow>> {
        let conn = self.conn.lock();
        let (clause, bounds) = range_clause(start, end);
        let sql = format!(
            "SELECT timestamp, open_interest FROM fut_open_interest
             WHERE asset = ?1{clause} ORDER BY timestamp ASC{}",
            limit_clause(limit)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(
                std::iter::once(rusqlite::types::Value::from(asset.to_string())).chain(bounds),
            ),
            |row| {
                Ok(OpenInterestRow {
                    timestamp: epoch_to_utc(row.get(0)?),
                    open_interest: row.get(1)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ==================== lending ====================

    pub fn upsert_lending_batch(&self, asset: &str, rows: &[LendingRow]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = count_rows(&tx, "lending", asset)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO lending (asset, timestamp, supply_rate_ray, var_borrow_rate_ray,
                                      stable_borrow_rate_ray, liquidity_index, variable_borrow_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(asset, timestamp) DO UPDATE SET
                     supply_rate_ray = excluded.supply_rate_ray,
                     var_borrow_rate_ray = excluded.var_borrow_rate_ray,
                     stable_borrow_rate_ray = excluded.stable_borrow_rate_ray,
                     liquidity_index = excluded.liquidity_index,
                     variable_borrow_index = excluded.variable_borrow_index",
            )?;
            for r in rows {
                stmt.execute(params![
                    asset,
                    r.timestamp.timestamp(),
                    r.supply_rate_ray,
                    r.var_borrow_rate_ray,
                    r.stable_borrow_rate_ray,
                    r.liquidity_index,
                    r.variable_borrow_index
                ])?;
            }
        }
        let after = count_rows(&tx, "lending", asset)?;
        tx.commit()?;
        Ok((after - before) as usize)
    }

    pub fn get_lending(
        &self,
        asset: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LendingRow>> {
        let conn = self.conn.lock();
        let (clause, bounds) = range_clause(start, end);
        let sql = format!(
            "SELECT timestamp, supply_rate_ray, var_borrow_rate_ray, stable_borrow_rate_ray,
                    liquidity_index, variable_borrow_index
             FROM lending WHERE asset = ?1{clause} ORDER BY timestamp ASC{}",
            limit_clause(limit)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(
                std::iter::once(rusqlite::types::Value::from(asset.to_string())).chain(bounds),
            ),
            |row| {
                Ok(LendingRow {
                    timestamp: epoch_to_utc(row.get(0)?),
                    supply_rate_ray: row.get(1)?,
                    var_borrow_rate_ray: row.get(2)?,
                    stable_borrow_rate_ray: row.get(3)?,
                    liquidity_index: row.get(4)?,
                    variable_borrow_index: row.get(5)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ==================== coverage & backfill state ====================

    pub fn earliest_timestamp(&self, metric: Metric, asset: &str) -> Result<Option<DateTime<Utc>>> {
        self.boundary_timestamp(metric, asset, "MIN")
    }

    pub fn latest_timestamp(&self, metric: Metric, asset: &str) -> Result<Option<DateTime<Utc>>> {
        self.boundary_timestamp(metric, asset, "MAX")
    }

    fn boundary_timestamp(
        &self,
        metric: Metric,
        asset: &str,
        agg: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {agg}(timestamp) FROM {} WHERE asset = ?1",
            metric.as_str()
        );
        let ts: Option<i64> = conn.query_row(&sql, params![asset], |row| row.get(0))?;
        Ok(ts.map(epoch_to_utc))
    }

    pub fn row_count(&self, metric: Metric, asset: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let sql = format!("SELECT COUNT(*) FROM {} WHERE asset = ?1", metric.as_str());
        conn.query_row(&sql, params![asset], |row| row.get(0))
            .map_err(Into::into)
    }

    pub fn get_backfill_state(&self, asset: &str, metric: Metric) -> Result<Option<BackfillState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT completed, last_fetched_timestamp FROM backfill_state
             WHERE asset = ?1 AND metric = ?2",
        )?;
        let state = stmt
            .query_row(params![asset, metric.as_str()], |row| {
                let completed: i64 = row.get(0)?;
                let last: Option<i64> = row.get(1)?;
                Ok(BackfillState {
                    asset: asset.to_string(),
                    metric: metric.as_str().to_string(),
                    completed: completed != 0,
                    last_fetched_timestamp: last.map(epoch_to_utc),
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(state)
    }

    pub fn is_backfill_completed(&self, asset: &str, metric: Metric) -> Result<bool> {
        Ok(self
            .get_backfill_state(asset, metric)?
            .map(|s| s.completed)
            .unwrap_or(false))
    }

    pub fn set_backfill_state(
        &self,
        asset: &str,
        metric: Metric,
        completed: bool,
        last_fetched_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backfill_state (asset, metric, completed, last_fetched_timestamp, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(asset, metric) DO UPDATE SET
                 completed = excluded.completed,
                 last_fetched_timestamp = excluded.last_fetched_timestamp,
                 updated_at = excluded.updated_at",
            params![
                asset,
                metric.as_str(),
                completed as i64,
                last_fetched_timestamp.map(|t| t.timestamp()),
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    // ==================== gap detection ====================

    /// Detect missing grid points for a fixed-cadence metric.
    ///
    /// Builds the expected grid from the stored earliest timestamp, subtracts
    /// the stored set, and coalesces consecutive misses into inclusive
    /// (gap_start, gap_end) ranges. Not meaningful for open interest
    /// (retention-bounded) or lending (event-driven snapshots); callers skip
    /// those metrics.
    pub fn detect_gaps(
        &self,
        metric: Metric,
        asset: &str,
        interval: Duration,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let step = interval.num_seconds();
        if step <= 0 {
            return Err(ServiceError::Storage("non-positive gap interval".into()));
        }

        let stored: Vec<i64> = {
            let conn = self.conn.lock();
            let sql = format!(
                "SELECT timestamp FROM {} WHERE asset = ?1 ORDER BY timestamp ASC",
                metric.as_str()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![asset], |row| row.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if stored.len() < 2 {
            return Ok(Vec::new());
        }

        let present: std::collections::HashSet<i64> = stored.iter().copied().collect();
        let (first, last) = (stored[0], stored[stored.len() - 1]);

        let mut gaps: Vec<(i64, i64)> = Vec::new();
        let mut open: Option<(i64, i64)> = None;

        let mut t = first + step;
        while t < last {
            if present.contains(&t) {
                if let Some(range) = open.take() {
                    gaps.push(range);
                }
            } else {
                open = Some(match open {
                    Some((s, _)) => (s, t),
                    None => (t, t),
                });
            }
            t += step;
        }
        if let Some(range) = open {
            gaps.push(range);
        }

        Ok(gaps
            .into_iter()
            .map(|(s, e)| (epoch_to_utc(s), epoch_to_utc(e)))
            .collect())
    }
}

fn epoch_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn count_rows(conn: &Connection, table: &str, asset: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE asset = ?1"),
        params![asset],
        |row| row.get(0),
    )
}

fn range_clause(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (String, Vec<rusqlite::types::Value>) {
    let mut clause = String::new();
    let mut bounds: Vec<rusqlite::types::Value> = Vec::new();
    let mut idx = 2;
    if let Some(s) = start {
        clause.push_str(&format!(" AND timestamp >= ?{idx}"));
        bounds.push(s.timestamp().into());
        idx += 1;
    }
    if let Some(e) = end {
        clause.push_str(&format!(" AND timestamp <= ?{idx}"));
        bounds.push(e.timestamp().into());
    }
    (clause, bounds)
}

fn limit_clause(limit: Option<usize>) -> String {
    match limit {
        Some(n) => format!(" LIMIT {n}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(ts: DateTime<Utc>, close: f64) -> OhlcvCandle {
        OhlcvCandle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            filled: false,
        }
    }

    fn ts(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    #[test]
    fn upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let batch: Vec<OhlcvCandle> = (0..4).map(|i| candle(ts(i * 12), 100.0 + i as f64)).collect();

        let first = db.upsert_ohlcv_batch("BTC", &batch).unwrap();
        assert_eq!(first, 4);

        // Second run of the same batch inserts nothing new.
        let second = db.upsert_ohlcv_batch("BTC", &batch).unwrap();
        assert_eq!(second, 0);
        assert_eq!(db.row_count(Metric::SpotOhlcv, "BTC").unwrap(), 4);
    }

    #[test]
    fn range_read_is_ascending_and_bounded() {
        let db = Database::open_in_memory().unwrap();
        let batch: Vec<OhlcvCandle> = (0..10).map(|i| candle(ts(i * 12), i as f64)).collect();
        db.upsert_ohlcv_batch("ETH", &batch).unwrap();

        let rows = db
            .get_ohlcv("ETH", Some(ts(24)), Some(ts(72)), None)
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(rows[0].timestamp, ts(24));

        let limited = db.get_ohlcv("ETH", None, None, Some(3)).unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn gap_detection_coalesces_consecutive_misses() {
        let db = Database::open_in_memory().unwrap();
        // 12h grid with holes at hours 24, 36 (consecutive) and 84.
        for h in [0i64, 12, 48, 60, 72, 96] {
            db.upsert_ohlcv_batch("BTC", &[candle(ts(h), 1.0)]).unwrap();
        }

        let gaps = db
            .detect_gaps(Metric::SpotOhlcv, "BTC", Duration::hours(12))
            .unwrap();
        assert_eq!(gaps, vec![(ts(24), ts(36)), (ts(84), ts(84))]);
    }

    #[test]
    fn gap_closure_after_fill() {
        let db = Database::open_in_memory().unwrap();
        for h in [0i64, 12, 36, 48] {
            db.upsert_ohlcv_batch("SOL", &[candle(ts(h), 1.0)]).unwrap();
        }
        assert_eq!(
            db.detect_gaps(Metric::SpotOhlcv, "SOL", Duration::hours(12))
                .unwrap()
                .len(),
            1
        );

        db.upsert_ohlcv_batch("SOL", &[candle(ts(24), 1.0)]).unwrap();
        assert!(db
            .detect_gaps(Metric::SpotOhlcv, "SOL", Duration::hours(12))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn backfill_state_round_trip() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_backfill_completed("BTC", Metric::SpotOhlcv).unwrap());

        db.set_backfill_state("BTC", Metric::SpotOhlcv, true, Some(ts(48)))
            .unwrap();
        let state = db
            .get_backfill_state("BTC", Metric::SpotOhlcv)
            .unwrap()
            .unwrap();
        assert!(state.completed);
        assert_eq!(state.last_fetched_timestamp, Some(ts(48)));

        // Progress survives a failed run being recorded.
        db.set_backfill_state("BTC", Metric::SpotOhlcv, false, Some(ts(48)))
            .unwrap();
        assert!(!db.is_backfill_completed("BTC", Metric::SpotOhlcv).unwrap());
    }

    #[test]
    fn lending_rows_preserve_ray_strings() {
        let db = Database::open_in_memory().unwrap();
        let row = LendingRow {
            timestamp: ts(0),
            supply_rate_ray: "12345678901234567890123456".to_string(),
            var_borrow_rate_ray: "22345678901234567890123456".to_string(),
            stable_borrow_rate_ray: "0".to_string(),
            liquidity_index: "1000000000000000000000000001".to_string(),
            variable_borrow_index: "1000000000000000000000000002".to_string(),
        };
        db.upsert_lending_batch("WETH", &[row.clone()]).unwrap();

        let rows = db.get_lending("WETH", None, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        // Full 28-digit string survives storage untouched.
        assert_eq!(rows[0].liquidity_index, row.liquidity_index);
    }

    #[test]
    fn lending_indices_read_back_monotone() {
        let db = Database::open_in_memory().unwrap();
        // Upsert out of order; ascending reads restore the monotone series.
        let mut rows: Vec<LendingRow> = (0..5)
            .map(|i| LendingRow {
                timestamp: ts(i * 24),
                supply_rate_ray: "0".to_string(),
                var_borrow_rate_ray: "0".to_string(),
                stable_borrow_rate_ray: "0".to_string(),
                liquidity_index: format!("10{i}0000000000000000000000000"),
                variable_borrow_index: format!("10{i}5000000000000000000000000"),
            })
            .collect();
        rows.reverse();
        db.upsert_lending_batch("USDC", &rows).unwrap();

        let stored = db.get_lending("USDC", None, None, None).unwrap();
        let indices: Vec<f64> = stored
            .iter()
            .map(|r| r.liquidity_index.parse::<f64>().unwrap())
            .collect();
        assert!(indices.windows(2).all(|w| w[1] >= w[0]));
        let borrow: Vec<f64> = stored
            .iter()
            .map(|r| r.variable_borrow_index.parse::<f64>().unwrap())
            .collect();
        assert!(borrow.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn funding_rows_round_trip_with_optional_mark() {
        let db = Database::open_in_memory().unwrap();
        let rows = vec![
            FundingRateRow {
                timestamp: ts(0),
                funding_rate: 0.0001,
                mark_price: Some(50_000.0),
            },
            FundingRateRow {
                timestamp: ts(8),
                funding_rate: -0.0002,
                mark_price: None,
            },
        ];
        db.upsert_funding_batch("BTC", &rows).unwrap();

        let stored = db.get_funding_rates("BTC", None, None, None).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].mark_price, Some(50_000.0));
        assert_eq!(stored[1].mark_price, None);

        assert_eq!(db.latest_timestamp(Metric::FutFunding, "BTC").unwrap(), Some(ts(8)));
        assert_eq!(db.earliest_timestamp(Metric::FutFunding, "BTC").unwrap(), Some(ts(0)));
    }
}

use async_trait::async_trait;
use corelib::time::{from_millis, to_millis};
use corelib::{Alert, AlertDetails, Bar, Factor, NewAlert, Quote, Symbol, TimeRange, Trade};
use engine::Batch;
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, Decode, Row, Type};
use tracing::{debug, instrument, warn};

use super::{
    AlertOrder, AlertQuery, AlertSink, AppendOutcome, LoadedBatch, TableLoader, TimeSeriesStore,
};
use crate::db::Db;
use crate::error::StoreError;

/// sqlx-backed store over the `Any` driver.
/// Responsible only for persistence and row mapping.
///
/// Placeholders are written `$n`, which both the SQLite and Postgres drivers accept.
#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn from_db(db: &Db) -> Self {
        Self::new(db.pool.clone())
    }

    async fn fetch_bars(&self, symbol: Option<&Symbol>, range: TimeRange) -> Result<(Vec<Bar>, usize), StoreError> {
        let rows = fetch_series(
            &self.pool,
            "SELECT symbol, ts_ms, open, high, low, close, volume FROM fact_bars_1m",
            symbol,
            range,
        )
        .await?;
        Ok(decode_all(rows, "fact_bars_1m", row_to_bar))
    }

    async fn fetch_quotes(&self, symbol: Option<&Symbol>, range: TimeRange) -> Result<(Vec<Quote>, usize), StoreError> {
        let rows = fetch_series(
            &self.pool,
            "SELECT symbol, ts_ms, bid, ask, bid_size, ask_size FROM stg_quotes",
            symbol,
            range,
        )
        .await?;
        Ok(decode_all(rows, "stg_quotes", row_to_quote))
    }

    async fn fetch_factors(&self, symbol: Option<&Symbol>, range: TimeRange) -> Result<(Vec<Factor>, usize), StoreError> {
        let rows = fetch_series(
            &self.pool,
            "SELECT symbol, ts_ms, spread_bp, vol_5m, vol_30m, fair_value FROM fact_factors",
            symbol,
            range,
        )
        .await?;
        Ok(decode_all(rows, "fact_factors", row_to_factor))
    }
}

#[async_trait]
impl TimeSeriesStore for SqlStore {
    async fn symbols(&self) -> Result<Vec<Symbol>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT symbol FROM fact_bars_1m
UNION
SELECT symbol FROM fact_factors
UNION
SELECT symbol FROM stg_quotes
ORDER BY symbol;
"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let (symbols, _) = decode_all(rows, "symbols", |r| col::<String>(r, "symbol").map(Symbol::from));
        Ok(symbols)
    }

    async fn bars(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Bar>, StoreError> {
        Ok(self.fetch_bars(Some(symbol), range).await?.0)
    }

    async fn quotes(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Quote>, StoreError> {
        Ok(self.fetch_quotes(Some(symbol), range).await?.0)
    }

    async fn factors(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Factor>, StoreError> {
        Ok(self.fetch_factors(Some(symbol), range).await?.0)
    }

    #[instrument(skip(self), target = "store")]
    async fn load_batch(&self, range: TimeRange) -> Result<LoadedBatch, StoreError> {
        let (bars, bad_bars) = self.fetch_bars(None, range).await?;
        let (quotes, bad_quotes) = self.fetch_quotes(None, range).await?;
        let (factors, bad_factors) = self.fetch_factors(None, range).await?;

        debug!(
            bars = bars.len(),
            quotes = quotes.len(),
            factors = factors.len(),
            "batch loaded"
        );

        Ok(LoadedBatch {
            batch: Batch::from_rows(bars, quotes, factors),
            malformed_rows: bad_bars + bad_quotes + bad_factors,
        })
    }

    async fn bars_before(
        &self,
        before: chrono::DateTime<chrono::Utc>,
        per_symbol: usize,
    ) -> Result<Vec<Bar>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT symbol, ts_ms, open, high, low, close, volume
FROM (
  SELECT symbol, ts_ms, open, high, low, close, volume,
         ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY ts_ms DESC) AS rn
  FROM fact_bars_1m
  WHERE ts_ms < $1
) history
WHERE rn <= $2
ORDER BY symbol, ts_ms;
"#,
        )
        .bind(to_millis(before))
        .bind(limit_i64(per_symbol))
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_all(rows, "fact_bars_1m", row_to_bar).0)
    }

    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Bar>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT symbol, ts_ms, open, high, low, close, volume
FROM fact_bars_1m
WHERE symbol = $1
ORDER BY ts_ms DESC
LIMIT $2;
"#,
        )
        .bind(symbol.as_str().to_string())
        .bind(limit_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_all(rows, "fact_bars_1m", row_to_bar).0)
    }

    async fn recent_factors(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Factor>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT symbol, ts_ms, spread_bp, vol_5m, vol_30m, fair_value
FROM fact_factors
WHERE symbol = $1
ORDER BY ts_ms DESC
LIMIT $2;
"#,
        )
        .bind(symbol.as_str().to_string())
        .bind(limit_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_all(rows, "fact_factors", row_to_factor).0)
    }
}

#[async_trait]
impl AlertSink for SqlStore {
    #[instrument(skip(self, alerts), target = "sink", fields(count = alerts.len()))]
    async fn append(&self, alerts: &[NewAlert]) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = AppendOutcome::default();

        for alert in alerts {
            let res = sqlx::query(
                r#"
INSERT INTO surveillance_alerts (symbol, ts_ms, rule, score, details)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (symbol, ts_ms, rule) DO NOTHING;
"#,
            )
            .bind(alert.symbol.as_str().to_string())
            .bind(to_millis(alert.timestamp))
            .bind(alert.rule.clone())
            .bind(alert.score)
            .bind(alert.details_text())
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() > 0 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        tx.commit().await?;
        debug!(inserted = outcome.inserted, duplicates = outcome.duplicates, "alerts appended");
        Ok(outcome)
    }

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Alert>, StoreError> {
        let (from, to) = range_bounds(query.range);

        let mut sql = String::from(
            "SELECT id, symbol, ts_ms, rule, score, details FROM surveillance_alerts \
             WHERE ts_ms >= $1 AND ts_ms < $2",
        );
        let mut next = 3;
        if query.symbol.is_some() {
            sql.push_str(&format!(" AND symbol = ${next}"));
            next += 1;
        }
        sql.push_str(match query.order {
            AlertOrder::TimestampDesc => " ORDER BY ts_ms DESC, id DESC",
            AlertOrder::ScoreDesc => " ORDER BY score DESC, ts_ms DESC, id DESC",
        });
        if query.limit.is_some() {
            sql.push_str(&format!(" LIMIT ${next}"));
        }

        let mut q = sqlx::query(&sql).bind(from).bind(to);
        if let Some(symbol) = &query.symbol {
            q = q.bind(symbol.as_str().to_string());
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit_i64(limit));
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(decode_all(rows, "surveillance_alerts", row_to_alert).0)
    }
}

#[async_trait]
impl TableLoader for SqlStore {
    async fn replace_trades(&self, rows: &[Trade]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM stg_trades;").execute(&mut *tx).await?;

        for t in rows {
            sqlx::query("INSERT INTO stg_trades (symbol, ts_ms, price, size) VALUES ($1, $2, $3, $4);")
                .bind(t.symbol.as_str().to_string())
                .bind(to_millis(t.timestamp))
                .bind(t.price)
                .bind(t.size)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn replace_quotes(&self, rows: &[Quote]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM stg_quotes;").execute(&mut *tx).await?;

        for q in rows {
            sqlx::query(
                r#"
INSERT INTO stg_quotes (symbol, ts_ms, bid, ask, bid_size, ask_size)
VALUES ($1, $2, $3, $4, $5, $6);
"#,
            )
            .bind(q.symbol.as_str().to_string())
            .bind(to_millis(q.timestamp))
            .bind(q.bid)
            .bind(q.ask)
            .bind(q.bid_size)
            .bind(q.ask_size)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn replace_bars(&self, rows: &[Bar]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fact_bars_1m;").execute(&mut *tx).await?;

        // first row wins on a repeated (symbol, ts)
        let mut written = 0;

        for b in rows {
            written += sqlx::query(
                r#"
INSERT INTO fact_bars_1m (symbol, ts_ms, open, high, low, close, volume)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (symbol, ts_ms) DO NOTHING;
"#,
            )
            .bind(b.symbol.as_str().to_string())
            .bind(to_millis(b.timestamp))
            .bind(b.open)
            .bind(b.high)
            .bind(b.low)
            .bind(b.close)
            .bind(b.volume)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn replace_factors(&self, rows: &[Factor]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fact_factors;").execute(&mut *tx).await?;

        let mut written = 0;

        for f in rows {
            written += sqlx::query(
                r#"
INSERT INTO fact_factors (symbol, ts_ms, spread_bp, vol_5m, vol_30m, fair_value)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (symbol, ts_ms) DO NOTHING;
"#,
            )
            .bind(f.symbol.as_str().to_string())
            .bind(to_millis(f.timestamp))
            .bind(f.spread_bp)
            .bind(f.vol_5m)
            .bind(f.vol_30m)
            .bind(f.fair_value)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }
}

/* =========================
Queries
========================= */

/// `SELECT ... FROM <table>` restricted to `range` (and `symbol` when given),
/// ordered by `(symbol, ts_ms)`.
async fn fetch_series(
    pool: &AnyPool,
    select: &str,
    symbol: Option<&Symbol>,
    range: TimeRange,
) -> Result<Vec<AnyRow>, StoreError> {
    let (from, to) = range_bounds(range);

    let sql = match symbol {
        Some(_) => format!("{select} WHERE ts_ms >= $1 AND ts_ms < $2 AND symbol = $3 ORDER BY symbol, ts_ms"),
        None => format!("{select} WHERE ts_ms >= $1 AND ts_ms < $2 ORDER BY symbol, ts_ms"),
    };

    let mut q = sqlx::query(&sql).bind(from).bind(to);
    if let Some(s) = symbol {
        q = q.bind(s.as_str().to_string());
    }

    Ok(q.fetch_all(pool).await?)
}

fn range_bounds(range: TimeRange) -> (i64, i64) {
    (
        range.from.map(to_millis).unwrap_or(i64::MIN),
        range.to.map(to_millis).unwrap_or(i64::MAX),
    )
}

fn limit_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/* =========================
Row mapping
========================= */

/// Decodes every row; rows that fail are skipped and counted, not fatal.
fn decode_all<T>(
    rows: Vec<AnyRow>,
    table: &str,
    decode: impl Fn(&AnyRow) -> Result<T, String>,
) -> (Vec<T>, usize) {
    let mut out = Vec::with_capacity(rows.len());
    let mut skipped = 0;

    for r in &rows {
        match decode(r) {
            Ok(v) => out.push(v),
            Err(e) => {
                // poison-row resilience: skip but don't fail the batch
                warn!(target: "store", table, error = %e, "skipping malformed row");
                skipped += 1;
            }
        }
    }

    (out, skipped)
}

fn col<'r, T>(r: &'r AnyRow, name: &str) -> Result<T, String>
where
    T: Decode<'r, Any> + Type<Any>,
{
    r.try_get::<T, _>(name).map_err(|e| format!("{name}: {e}"))
}

fn ts_col(r: &AnyRow) -> Result<chrono::DateTime<chrono::Utc>, String> {
    from_millis(col::<i64>(r, "ts_ms")?).map_err(|e| e.to_string())
}

fn row_to_bar(r: &AnyRow) -> Result<Bar, String> {
    Ok(Bar {
        symbol: Symbol::from(col::<String>(r, "symbol")?),
        timestamp: ts_col(r)?,
        open: col(r, "open")?,
        high: col(r, "high")?,
        low: col(r, "low")?,
        close: col(r, "close")?,
        volume: col(r, "volume")?,
    })
}

fn row_to_quote(r: &AnyRow) -> Result<Quote, String> {
    Ok(Quote {
        symbol: Symbol::from(col::<String>(r, "symbol")?),
        timestamp: ts_col(r)?,
        bid: col(r, "bid")?,
        ask: col(r, "ask")?,
        bid_size: col(r, "bid_size")?,
        ask_size: col(r, "ask_size")?,
    })
}

fn row_to_factor(r: &AnyRow) -> Result<Factor, String> {
    Ok(Factor {
        symbol: Symbol::from(col::<String>(r, "symbol")?),
        timestamp: ts_col(r)?,
        spread_bp: col(r, "spread_bp")?,
        vol_5m: col(r, "vol_5m")?,
        vol_30m: col(r, "vol_30m")?,
        fair_value: col(r, "fair_value")?,
    })
}

fn row_to_alert(r: &AnyRow) -> Result<Alert, String> {
    let raw: String = col(r, "details")?;
    let details: AlertDetails =
        serde_json::from_str(&raw).map_err(|e| format!("details: {e}"))?;

    Ok(Alert {
        id: col(r, "id")?,
        symbol: Symbol::from(col::<String>(r, "symbol")?),
        timestamp: ts_col(r)?,
        rule: col(r, "rule")?,
        score: col(r, "score")?,
        details,
    })
}

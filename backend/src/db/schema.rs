use sqlx::AnyPool;

use super::Backend;
use crate::error::StoreError;

/// Timestamps are stored as epoch milliseconds (`ts_ms`) so both dialects
/// share one encoding through the `Any` driver.
const TABLES: &[&str] = &[
    // Staging, batch-replaced by each ingest
    r#"
CREATE TABLE IF NOT EXISTS stg_trades (
  symbol TEXT NOT NULL,
  ts_ms BIGINT NOT NULL,
  price DOUBLE PRECISION NOT NULL,
  size BIGINT NOT NULL
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS stg_quotes (
  symbol TEXT NOT NULL,
  ts_ms BIGINT NOT NULL,
  bid DOUBLE PRECISION NOT NULL,
  ask DOUBLE PRECISION NOT NULL,
  bid_size BIGINT NOT NULL,
  ask_size BIGINT NOT NULL
);
"#,
    // Transform outputs
    r#"
CREATE TABLE IF NOT EXISTS fact_bars_1m (
  symbol TEXT NOT NULL,
  ts_ms BIGINT NOT NULL,
  open DOUBLE PRECISION NOT NULL,
  high DOUBLE PRECISION NOT NULL,
  low DOUBLE PRECISION NOT NULL,
  close DOUBLE PRECISION NOT NULL,
  volume DOUBLE PRECISION NOT NULL,
  PRIMARY KEY (symbol, ts_ms)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS fact_factors (
  symbol TEXT NOT NULL,
  ts_ms BIGINT NOT NULL,
  spread_bp DOUBLE PRECISION NOT NULL,
  vol_5m DOUBLE PRECISION,
  vol_30m DOUBLE PRECISION,
  fair_value DOUBLE PRECISION,
  PRIMARY KEY (symbol, ts_ms)
);
"#,
];

const INDEXES: &[&str] = &[
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_alerts_key ON surveillance_alerts(symbol, ts_ms, rule);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_alerts_ts ON surveillance_alerts(ts_ms);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_stg_trades_symbol_ts ON stg_trades(symbol, ts_ms);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_stg_quotes_symbol_ts ON stg_quotes(symbol, ts_ms);"#,
];

fn alerts_table(backend: Backend) -> String {
    let id = match backend {
        Backend::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        Backend::Postgres => "id BIGSERIAL PRIMARY KEY",
    };

    format!(
        r#"
CREATE TABLE IF NOT EXISTS surveillance_alerts (
  {id},
  symbol TEXT NOT NULL,
  ts_ms BIGINT NOT NULL,
  rule TEXT NOT NULL,
  score DOUBLE PRECISION NOT NULL,
  details TEXT NOT NULL
);
"#
    )
}

pub async fn migrate(pool: &AnyPool, backend: Backend) -> Result<(), StoreError> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    sqlx::query(&alerts_table(backend)).execute(pool).await?;

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::debug!(target: "db", ?backend, "schema ready");
    Ok(())
}

//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use corelib::{Alert, Bar, Factor, NewAlert};
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use surveillance::db::{Backend, Db};
use surveillance::error::StoreError;
use surveillance::store::{AlertQuery, AlertSink, AppendOutcome};

/// Isolated in-memory DB per test.
/// `cache=shared` lets every connection of the pool see the same database.
pub async fn setup_db() -> Db {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    let pool: AnyPool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn)
        .await
        .expect("connect sqlite memory db");

    let db = Db {
        pool,
        backend: Backend::Sqlite,
    };
    db.migrate().await.expect("migrate");
    db
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 2, 9, 30, 0).unwrap()
}

pub fn minute(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

pub fn bar(sym: &str, m: i64, close: f64) -> Bar {
    Bar {
        symbol: sym.into(),
        timestamp: minute(m),
        open: close,
        high: close,
        low: close,
        close,
        volume: 100.0,
    }
}

pub fn factor(sym: &str, m: i64, spread_bp: f64) -> Factor {
    Factor {
        symbol: sym.into(),
        timestamp: minute(m),
        spread_bp,
        vol_5m: None,
        vol_30m: None,
        fair_value: Some(10.0),
    }
}

/// `[100 x 11, 200]`: the last bar's return is a spike above 3 sigma.
pub fn spike_bars(sym: &str) -> Vec<Bar> {
    let mut bars: Vec<Bar> = (0..11).map(|m| bar(sym, m, 100.0)).collect();
    bars.push(bar(sym, 11, 200.0));
    bars
}

/// Sink that refuses every write.
pub struct FailingSink;

#[async_trait]
impl AlertSink for FailingSink {
    async fn append(&self, _alerts: &[NewAlert]) -> Result<AppendOutcome, StoreError> {
        Err(StoreError::Unavailable("sink offline".into()))
    }

    async fn query(&self, _query: &AlertQuery) -> Result<Vec<Alert>, StoreError> {
        Ok(vec![])
    }
}

pub fn temp_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("surveillance-{label}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

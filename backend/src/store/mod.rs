//! Storage boundary: time-series reads, alert sink, table loaders.
//!
//! Every operation here is one bulk request. Nothing is called per row from
//! inside the rule engine.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corelib::{Alert, Bar, Factor, NewAlert, Quote, Symbol, TimeRange, Trade};
use engine::Batch;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Rows read for one run. Rows that could not be decoded are skipped and counted.
#[derive(Debug, Default)]
pub struct LoadedBatch {
    pub batch: Batch,
    pub malformed_rows: usize,
}

/// Read side of the time-series store. Results are ascending by timestamp
/// within a symbol unless the method says otherwise.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn symbols(&self) -> Result<Vec<Symbol>, StoreError>;

    async fn bars(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Bar>, StoreError>;

    async fn quotes(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Quote>, StoreError>;

    async fn factors(&self, symbol: &Symbol, range: TimeRange)
    -> Result<Vec<Factor>, StoreError>;

    /// All symbols' bars, quotes and factors in `range`, ordered by
    /// `(symbol, timestamp)`.
    async fn load_batch(&self, range: TimeRange) -> Result<LoadedBatch, StoreError>;

    /// Up to `per_symbol` latest bars strictly before `before`, for every
    /// symbol, ordered by `(symbol, timestamp)`.
    async fn bars_before(
        &self,
        before: DateTime<Utc>,
        per_symbol: usize,
    ) -> Result<Vec<Bar>, StoreError>;

    /// `load_batch(range)` with up to `lookback` earlier bars in front of each
    /// symbol's bars, so windows at the start of `range` see the same history
    /// as an unbounded read.
    async fn load_batch_with_history(
        &self,
        range: TimeRange,
        lookback: usize,
    ) -> Result<LoadedBatch, StoreError> {
        let loaded = self.load_batch(range).await?;
        let (Some(from), true) = (range.from, lookback > 0) else {
            return Ok(loaded);
        };

        let history = self.bars_before(from, lookback).await?;
        Ok(LoadedBatch {
            batch: loaded.batch.with_bar_history(history),
            malformed_rows: loaded.malformed_rows,
        })
    }

    /// Most recent bars first.
    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Bar>, StoreError>;

    /// Most recent factors first.
    async fn recent_factors(&self, symbol: &Symbol, limit: usize)
    -> Result<Vec<Factor>, StoreError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlertOrder {
    #[default]
    TimestampDesc,
    ScoreDesc,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlertQuery {
    pub symbol: Option<Symbol>,
    pub range: TimeRange,
    pub order: AlertOrder,
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn for_symbol(mut self, symbol: impl Into<Symbol>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn in_range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    pub fn ordered_by(mut self, order: AlertOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Newly recorded alerts.
    pub inserted: usize,
    /// Alerts whose `(symbol, timestamp, rule)` was already recorded.
    pub duplicates: usize,
}

/// Append-only alert sink, deduplicated on `(symbol, timestamp, rule)`.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Records the whole slice or nothing.
    async fn append(&self, alerts: &[NewAlert]) -> Result<AppendOutcome, StoreError>;

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Alert>, StoreError>;
}

/// Batch-replace writers used by ingestion. Each call atomically replaces the
/// table's contents with `rows`.
#[async_trait]
pub trait TableLoader: Send + Sync {
    async fn replace_trades(&self, rows: &[Trade]) -> Result<u64, StoreError>;

    async fn replace_quotes(&self, rows: &[Quote]) -> Result<u64, StoreError>;

    async fn replace_bars(&self, rows: &[Bar]) -> Result<u64, StoreError>;

    async fn replace_factors(&self, rows: &[Factor]) -> Result<u64, StoreError>;
}

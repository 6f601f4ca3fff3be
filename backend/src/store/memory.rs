use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corelib::{Alert, AlertKey, Bar, Factor, NewAlert, Quote, Symbol, TimeRange, Timestamped, Trade};
use engine::Batch;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use super::{
    AlertOrder, AlertQuery, AlertSink, AppendOutcome, LoadedBatch, TableLoader, TimeSeriesStore,
};
use crate::error::StoreError;

/// In-process store for tests and dry runs.
///
/// Same contract as `SqlStore`: reads come back ordered, alerts are
/// deduplicated on `(symbol, timestamp, rule)` and ids are assigned on insert.
#[derive(Default)]
pub struct MemoryStore {
    trades: RwLock<Vec<Trade>>,
    quotes: RwLock<Vec<Quote>>,
    bars: RwLock<Vec<Bar>>,
    factors: RwLock<Vec<Factor>>,
    alerts: RwLock<AlertTable>,
}

#[derive(Default)]
struct AlertTable {
    next_id: i64,
    rows: BTreeMap<AlertKey, Alert>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store from already-built rows.
    pub fn with_rows(bars: Vec<Bar>, quotes: Vec<Quote>, factors: Vec<Factor>) -> Self {
        let store = Self::new();
        *store.bars.write() = keep_first(bars);
        *store.quotes.write() = quotes;
        *store.factors.write() = keep_first(factors);
        store
    }

    pub fn trade_count(&self) -> usize {
        self.trades.read().len()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.read().rows.len()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn symbols(&self) -> Result<Vec<Symbol>, StoreError> {
        let mut set = BTreeSet::new();
        set.extend(self.bars.read().iter().map(|r| r.symbol.clone()));
        set.extend(self.quotes.read().iter().map(|r| r.symbol.clone()));
        set.extend(self.factors.read().iter().map(|r| r.symbol.clone()));
        Ok(set.into_iter().collect())
    }

    async fn bars(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Bar>, StoreError> {
        Ok(select(&self.bars.read(), Some(symbol), range))
    }

    async fn quotes(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Quote>, StoreError> {
        Ok(select(&self.quotes.read(), Some(symbol), range))
    }

    async fn factors(&self, symbol: &Symbol, range: TimeRange) -> Result<Vec<Factor>, StoreError> {
        Ok(select(&self.factors.read(), Some(symbol), range))
    }

    async fn load_batch(&self, range: TimeRange) -> Result<LoadedBatch, StoreError> {
        let batch = Batch::from_rows(
            select(&self.bars.read(), None, range),
            select(&self.quotes.read(), None, range),
            select(&self.factors.read(), None, range),
        );

        Ok(LoadedBatch {
            batch,
            malformed_rows: 0,
        })
    }

    async fn bars_before(&self, before: DateTime<Utc>, per_symbol: usize) -> Result<Vec<Bar>, StoreError> {
        let earlier = TimeRange {
            from: None,
            to: Some(before),
        };

        let mut grouped: BTreeMap<Symbol, Vec<Bar>> = BTreeMap::new();
        for bar in select(&self.bars.read(), None, earlier) {
            grouped.entry(bar.symbol.clone()).or_default().push(bar);
        }

        Ok(grouped
            .into_values()
            .flat_map(|bars| {
                let skip = bars.len().saturating_sub(per_symbol);
                bars.into_iter().skip(skip)
            })
            .collect())
    }

    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Bar>, StoreError> {
        Ok(latest(select(&self.bars.read(), Some(symbol), TimeRange::all()), limit))
    }

    async fn recent_factors(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Factor>, StoreError> {
        Ok(latest(select(&self.factors.read(), Some(symbol), TimeRange::all()), limit))
    }
}

#[async_trait]
impl AlertSink for MemoryStore {
    #[instrument(skip(self, alerts), target = "sink", fields(count = alerts.len()))]
    async fn append(&self, alerts: &[NewAlert]) -> Result<AppendOutcome, StoreError> {
        let mut table = self.alerts.write();
        let mut outcome = AppendOutcome::default();

        for alert in alerts {
            let key = alert.key();
            if table.rows.contains_key(&key) {
                outcome.duplicates += 1;
                continue;
            }

            table.next_id += 1;
            let id = table.next_id;
            table.rows.insert(key, Alert::from_new(id, alert.clone()));
            outcome.inserted += 1;
        }

        debug!(inserted = outcome.inserted, duplicates = outcome.duplicates, "alerts appended");
        Ok(outcome)
    }

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Alert>, StoreError> {
        let table = self.alerts.read();

        let mut out: Vec<Alert> = table
            .rows
            .values()
            .filter(|a| query.symbol.as_ref().is_none_or(|s| &a.symbol == s))
            .filter(|a| query.range.contains(a.timestamp))
            .cloned()
            .collect();

        match query.order {
            AlertOrder::TimestampDesc => {
                out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)))
            }
            AlertOrder::ScoreDesc => out.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then(b.timestamp.cmp(&a.timestamp))
                    .then(b.id.cmp(&a.id))
            }),
        }

        if let Some(limit) = query.limit {
            out.truncate(limit);
        }

        Ok(out)
    }
}

#[async_trait]
impl TableLoader for MemoryStore {
    async fn replace_trades(&self, rows: &[Trade]) -> Result<u64, StoreError> {
        *self.trades.write() = rows.to_vec();
        Ok(rows.len() as u64)
    }

    async fn replace_quotes(&self, rows: &[Quote]) -> Result<u64, StoreError> {
        *self.quotes.write() = rows.to_vec();
        Ok(rows.len() as u64)
    }

    async fn replace_bars(&self, rows: &[Bar]) -> Result<u64, StoreError> {
        let kept = keep_first(rows.to_vec());
        let n = kept.len() as u64;
        *self.bars.write() = kept;
        Ok(n)
    }

    async fn replace_factors(&self, rows: &[Factor]) -> Result<u64, StoreError> {
        let kept = keep_first(rows.to_vec());
        let n = kept.len() as u64;
        *self.factors.write() = kept;
        Ok(n)
    }
}

/// Rows of `symbol` (or every symbol) inside `range`, ordered by `(symbol, timestamp)`.
fn select<T: Timestamped + Clone>(rows: &[T], symbol: Option<&Symbol>, range: TimeRange) -> Vec<T> {
    let mut out: Vec<T> = rows
        .iter()
        .filter(|r| symbol.is_none_or(|s| r.symbol() == s))
        .filter(|r| range.contains(r.timestamp()))
        .cloned()
        .collect();

    // stable: equal keys keep insertion order
    out.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    out
}

fn sort_key<T: Timestamped>(r: &T) -> (&Symbol, DateTime<Utc>) {
    (r.symbol(), r.timestamp())
}

fn latest<T>(mut rows: Vec<T>, limit: usize) -> Vec<T> {
    rows.reverse();
    rows.truncate(limit);
    rows
}

/// Mirrors the `(symbol, ts)` primary key of the fact tables.
fn keep_first<T: Timestamped>(rows: Vec<T>) -> Vec<T> {
    let mut seen = BTreeSet::new();
    rows.into_iter()
        .filter(|r| seen.insert((r.symbol().clone(), r.timestamp())))
        .collect()
}

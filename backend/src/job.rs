//! One surveillance run: bulk read, evaluate, one atomic append.

use std::sync::Arc;
use std::time::Duration;

use common::logger::{TraceId, child_span, root_span, warn_if_slow};
use corelib::{Symbol, TimeRange};
use engine::{RuleEngine, RunReport};
use tracing::{Instrument, debug, info, warn};

use crate::error::AppError;
use crate::store::{AlertSink, TimeSeriesStore};

const SLOW_READ: Duration = Duration::from_secs(2);
const SLOW_APPEND: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobSummary {
    pub symbols: usize,
    pub rows: usize,
    /// Alerts handed to the sink after in-run deduplication.
    pub alerts_emitted: usize,
    pub inserted: usize,
    /// Alerts already recorded by an earlier run.
    pub duplicates: usize,
    /// Rows skipped by the store or the engine.
    pub malformed_rows: usize,
    pub rejected_symbols: Vec<Symbol>,
    pub faults: usize,
}

pub struct SurveillanceJob {
    store: Arc<dyn TimeSeriesStore>,
    sink: Arc<dyn AlertSink>,
    engine: RuleEngine,
    parallel: bool,
}

impl SurveillanceJob {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        sink: Arc<dyn AlertSink>,
        engine: RuleEngine,
        parallel: bool,
    ) -> Self {
        Self {
            store,
            sink,
            engine,
            parallel,
        }
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Evaluates every symbol in `range` and records the resulting alerts.
    ///
    /// Bars before a bounded start are read as window history, so a range
    /// run raises the same alerts inside the range as an unbounded run.
    ///
    /// The alert set is written all-or-nothing; on `SinkWrite` nothing was
    /// recorded and the same range can be retried. Re-running a range that
    /// already succeeded adds no alerts.
    pub async fn run(&self, range: TimeRange) -> Result<JobSummary, AppError> {
        let trace_id = TraceId::new();
        let span = root_span("surveillance_run", &trace_id);

        self.run_inner(range).instrument(span).await
    }

    async fn run_inner(&self, range: TimeRange) -> Result<JobSummary, AppError> {
        info!(target: "job", ?range, parallel = self.parallel, "surveillance run started");

        let lookback = self.engine.registry().bar_lookback();
        let loaded = warn_if_slow(
            "load_batch",
            SLOW_READ,
            self.store.load_batch_with_history(range, lookback),
        )
        .await
        .map_err(AppError::Store)?;
        let store_malformed = loaded.malformed_rows;

        let mut report: RunReport = if self.parallel {
            self.engine
                .run_partitioned(loaded.batch)
                .instrument(child_span("evaluate"))
                .await
        } else {
            child_span("evaluate").in_scope(|| self.engine.run_batch(&loaded.batch))
        };

        // history bars only feed the windows
        report.alerts.retain(|a| range.contains(a.timestamp));

        for failure in &report.failures {
            debug!(target: "job", symbol = ?failure.symbol(), error = %failure, "engine failure");
        }
        if !report.rejected_symbols.is_empty() {
            warn!(
                target: "job",
                rejected = report.rejected_symbols.len(),
                "symbols rejected for out-of-order input"
            );
        }

        let outcome = warn_if_slow("append_alerts", SLOW_APPEND, self.sink.append(&report.alerts))
            .await
            .map_err(AppError::SinkWrite)?;

        let summary = JobSummary {
            symbols: report.symbols,
            rows: report.rows,
            alerts_emitted: report.alerts.len(),
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            malformed_rows: store_malformed + report.malformed_rows,
            faults: report.faults(),
            rejected_symbols: report.rejected_symbols,
        };

        info!(
            target: "job",
            symbols = summary.symbols,
            alerts = summary.alerts_emitted,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            malformed = summary.malformed_rows,
            faults = summary.faults,
            "surveillance run finished"
        );

        Ok(summary)
    }
}

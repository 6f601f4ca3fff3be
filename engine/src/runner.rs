//! Rule engine orchestration.
//!
//! For each symbol of a batch:
//! 1) reject the symbol if any of its series is not strictly ascending
//! 2) derive the return windows the registered rules asked for
//! 3) evaluate every rule on every row of the series it consumes
//!
//! Symbols are independent, so a batch can be evaluated sequentially or fanned
//! out one blocking task per symbol. Either way the per-symbol outcomes are
//! merged serially: deduplicated by `(symbol, timestamp, rule)` and sorted by
//! that key, so identical input gives identical output.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use corelib::{AlertKey, Bar, Factor, NewAlert, Quote, Symbol};
use tokio::task::JoinSet;
use tracing::{Span, debug, error, instrument, warn};

use crate::error::{EngineError, RuleError};
use crate::registry::RuleRegistry;
use crate::returns::{ReturnPoint, return_points};
use crate::rules::{Rule, RowContext, RowRef, RuleInput};
use crate::series::{Batch, SymbolSeries};

/// Result of evaluating one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolOutcome {
    pub symbol: Symbol,
    pub alerts: Vec<NewAlert>,
    pub failures: Vec<EngineError>,
    /// Distinct rows skipped as malformed.
    pub malformed_rows: usize,
    pub rows: usize,
    /// The whole symbol was rejected (ordering violation).
    pub rejected: bool,
}

/// Merged result of one engine run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Deduplicated, sorted by `(symbol, timestamp, rule)`.
    pub alerts: Vec<NewAlert>,
    pub failures: Vec<EngineError>,
    pub rejected_symbols: Vec<Symbol>,
    pub symbols: usize,
    pub rows: usize,
    pub malformed_rows: usize,
    pub duplicates_suppressed: usize,
}

impl RunReport {
    fn merge(outcomes: Vec<SymbolOutcome>) -> Self {
        let mut report = RunReport {
            symbols: outcomes.len(),
            ..Default::default()
        };
        let mut unique: BTreeMap<AlertKey, NewAlert> = BTreeMap::new();

        for outcome in outcomes {
            report.rows += outcome.rows;
            report.malformed_rows += outcome.malformed_rows;
            report.failures.extend(outcome.failures);
            if outcome.rejected {
                report.rejected_symbols.push(outcome.symbol);
            }

            for alert in outcome.alerts {
                let key = alert.key();
                if unique.contains_key(&key) {
                    report.duplicates_suppressed += 1;
                } else {
                    unique.insert(key, alert);
                }
            }
        }

        report.alerts = unique.into_values().collect();
        report
    }

    /// Row/rule pairs that errored or panicked.
    pub fn faults(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f, EngineError::RuleFault { .. }))
            .count()
    }
}

/// Runs a registry of rules over finite batches. Holds no per-run state.
#[derive(Clone)]
pub struct RuleEngine {
    registry: Arc<RuleRegistry>,
}

impl RuleEngine {
    pub fn new(registry: RuleRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Groups the rows by symbol and evaluates them sequentially.
    pub fn run(&self, bars: &[Bar], quotes: &[Quote], factors: &[Factor]) -> RunReport {
        let batch = Batch::from_rows(bars.to_vec(), quotes.to_vec(), factors.to_vec());
        self.run_batch(&batch)
    }

    /// Sequential run, symbol by symbol.
    pub fn run_batch(&self, batch: &Batch) -> RunReport {
        let outcomes = batch.iter().map(|s| self.evaluate_symbol(s)).collect();
        RunReport::merge(outcomes)
    }

    /// One blocking task per symbol, merged serially once all have finished.
    pub async fn run_partitioned(&self, batch: Batch) -> RunReport {
        let mut set = JoinSet::new();
        for series in batch {
            let engine = self.clone();
            // blocking tasks do not inherit the caller's span
            let parent = Span::current();
            set.spawn_blocking(move || parent.in_scope(|| engine.evaluate_symbol(&series)));
        }

        let mut outcomes = Vec::with_capacity(set.len());
        let mut worker_failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(error = %e, "symbol partition task failed");
                    worker_failures.push(EngineError::PartitionFailed(e.to_string()));
                }
            }
        }

        // join order is arbitrary
        outcomes.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut report = RunReport::merge(outcomes);
        report.failures.extend(worker_failures);
        report
    }

    /// Evaluates every registered rule against one symbol's series.
    #[instrument(skip_all, target = "engine", fields(symbol = %series.symbol))]
    pub fn evaluate_symbol(&self, series: &SymbolSeries) -> SymbolOutcome {
        let mut out = SymbolOutcome {
            symbol: series.symbol.clone(),
            alerts: Vec::new(),
            failures: Vec::new(),
            malformed_rows: 0,
            rows: series.row_count(),
            rejected: false,
        };

        // series no rule reads cannot invalidate the symbol
        if let Err(e) = series.validate_inputs(&self.registry.inputs()) {
            warn!(error = %e, "rejecting symbol batch");
            out.rejected = true;
            out.failures.push(e);
            return out;
        }

        let windows: BTreeMap<usize, Vec<ReturnPoint>> = self
            .registry
            .return_windows()
            .into_iter()
            .map(|w| (w, return_points(&series.bars, w)))
            .collect();

        let mut malformed: BTreeSet<(RuleInput, usize)> = BTreeSet::new();

        for rule in self.registry.rules() {
            let points = rule.return_window().and_then(|w| windows.get(&w));

            match rule.input() {
                RuleInput::Bars => {
                    for (position, bar) in series.bars.iter().enumerate() {
                        let ctx = RowContext {
                            position,
                            returns: points.and_then(|p| p.get(position).copied()),
                        };
                        apply(rule.as_ref(), RowRef::Bar(bar), &ctx, &mut out, &mut malformed);
                    }
                }
                RuleInput::Quotes => {
                    for (position, quote) in series.quotes.iter().enumerate() {
                        let ctx = RowContext {
                            position,
                            returns: None,
                        };
                        apply(rule.as_ref(), RowRef::Quote(quote), &ctx, &mut out, &mut malformed);
                    }
                }
                RuleInput::Factors => {
                    for (position, factor) in series.factors.iter().enumerate() {
                        let ctx = RowContext {
                            position,
                            returns: None,
                        };
                        apply(rule.as_ref(), RowRef::Factor(factor), &ctx, &mut out, &mut malformed);
                    }
                }
            }
        }

        out.malformed_rows = malformed.len();
        debug!(
            rows = out.rows,
            alerts = out.alerts.len(),
            failures = out.failures.len(),
            "symbol evaluated"
        );
        out
    }
}

/// Evaluates one row/rule pair. Errors and panics are recorded, never raised.
fn apply(
    rule: &dyn Rule,
    row: RowRef<'_>,
    ctx: &RowContext,
    out: &mut SymbolOutcome,
    malformed: &mut BTreeSet<(RuleInput, usize)>,
) {
    let result = catch_unwind(AssertUnwindSafe(|| rule.evaluate(row, ctx)));

    match result {
        Ok(Ok(Some(alert))) => out.alerts.push(alert),
        Ok(Ok(None)) => {}
        Ok(Err(RuleError::MalformedRow(reason))) => {
            warn!(rule = rule.name(), ts = %row.timestamp(), %reason, "skipping malformed row");
            malformed.insert((row.input(), ctx.position));
            out.failures.push(EngineError::MalformedRow {
                symbol: row.symbol().clone(),
                series: row.input(),
                timestamp: row.timestamp(),
                rule: rule.name().to_string(),
                reason,
            });
        }
        Ok(Err(RuleError::Fault(reason))) => {
            warn!(rule = rule.name(), ts = %row.timestamp(), %reason, "rule fault");
            out.failures.push(EngineError::RuleFault {
                symbol: row.symbol().clone(),
                timestamp: row.timestamp(),
                rule: rule.name().to_string(),
                reason,
            });
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(rule = rule.name(), ts = %row.timestamp(), %reason, "rule panicked");
            out.failures.push(EngineError::RuleFault {
                symbol: row.symbol().clone(),
                timestamp: row.timestamp(),
                rule: rule.name().to_string(),
                reason,
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleConfig;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use tracing_test::traced_test;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 9, 30, 0).unwrap() + Duration::minutes(min)
    }

    fn bars(sym: &str, closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                symbol: Symbol::from(sym),
                timestamp: ts(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1_000.0,
            })
            .collect()
    }

    fn factor(sym: &str, min: i64, spread_bp: f64) -> Factor {
        Factor {
            symbol: Symbol::from(sym),
            timestamp: ts(min),
            spread_bp,
            vol_5m: Some(0.01),
            vol_30m: Some(0.02),
            fair_value: Some(100.0),
        }
    }

    fn engine() -> RuleEngine {
        RuleEngine::new(RuleRegistry::reference(RuleConfig::default()))
    }

    // ---------------------------------------------------------
    // Reference scenarios
    // ---------------------------------------------------------

    #[test]
    fn single_wide_factor_yields_exactly_one_alert() {
        let report = engine().run(&[], &[], &[factor("BBB", 0, 1.5)]);

        assert_eq!(report.alerts.len(), 1);
        let a = &report.alerts[0];
        assert_eq!(a.symbol, Symbol::from("BBB"));
        assert_eq!(a.rule, "wide_spread");
        assert_eq!(a.score, 1.5);
        assert_eq!(a.details.get("spread_bp"), Some(&json!(1.5)));
        assert!(report.failures.is_empty());
    }

    #[test]
    fn spike_after_long_flat_run_fires_return_spike() {
        let mut closes = vec![100.0; 11];
        closes.push(200.0);
        let report = engine().run(&bars("AAA", &closes), &[], &[]);

        assert_eq!(report.alerts.len(), 1);
        let a = &report.alerts[0];
        assert_eq!(a.rule, "return_spike");
        assert_eq!(a.timestamp, ts(11));
        assert_eq!(a.details.get("ret"), Some(&json!(1.0)));
        let z = a.details["z"].as_f64().unwrap();
        assert!((a.score - z.abs()).abs() < 1e-12);
        assert!(a.score > 3.0);
    }

    #[test]
    fn spike_on_eleventh_bar_is_bounded_below_threshold() {
        // ten defined returns cannot produce |z| above 9/sqrt(10)
        let mut closes = vec![100.0; 10];
        closes.push(200.0);
        let report = engine().run(&bars("AAA", &closes), &[], &[]);

        assert!(report.alerts.is_empty());
    }

    #[test]
    fn first_bar_alone_never_spikes() {
        let report = engine().run(&bars("AAA", &[1_000_000.0]), &[], &[]);
        assert!(report.alerts.is_empty());
        assert!(report.failures.is_empty());
    }

    // ---------------------------------------------------------
    // Ordering, failure isolation
    // ---------------------------------------------------------

    #[test]
    fn out_of_order_symbol_is_rejected_others_continue() {
        let mut aaa = bars("AAA", &[1.0, 2.0, 3.0]);
        aaa.swap(0, 2);

        let report = engine().run(&aaa, &[], &[factor("BBB", 0, 2.0), factor("AAA", 0, 5.0)]);

        assert_eq!(report.rejected_symbols, vec![Symbol::from("AAA")]);
        assert!(matches!(
            report.failures[0],
            EngineError::InputOrderingViolation { .. }
        ));
        // AAA's factor is dropped with the rest of AAA
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].symbol, Symbol::from("BBB"));
    }

    fn quote(sym: &str, min: i64) -> Quote {
        Quote {
            symbol: Symbol::from(sym),
            timestamp: ts(min),
            bid: 99.9,
            ask: 100.1,
            bid_size: 10,
            ask_size: 10,
        }
    }

    struct QuoteWatcher;

    impl Rule for QuoteWatcher {
        fn name(&self) -> &'static str {
            "quote_watcher"
        }

        fn input(&self) -> RuleInput {
            RuleInput::Quotes
        }

        fn evaluate(&self, _: RowRef<'_>, _: &RowContext) -> Result<Option<NewAlert>, RuleError> {
            Ok(None)
        }
    }

    #[test]
    fn repeated_quote_timestamps_only_matter_to_quote_rules() {
        let mut closes = vec![100.0; 11];
        closes.push(200.0);
        let b = bars("AAA", &closes);
        let q = vec![quote("AAA", 3), quote("AAA", 3)];

        let report = engine().run(&b, &q, &[]);
        assert!(report.rejected_symbols.is_empty());
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].rule, "return_spike");

        let mut reg = RuleRegistry::reference(RuleConfig::default());
        reg.register(QuoteWatcher);
        let report = RuleEngine::new(reg).run(&b, &q, &[]);
        assert_eq!(report.rejected_symbols, vec![Symbol::from("AAA")]);
        assert!(report.alerts.is_empty());
    }

    #[test]
    #[traced_test]
    fn rejection_is_logged() {
        let mut aaa = bars("AAA", &[1.0, 2.0]);
        aaa.reverse();

        engine().run(&aaa, &[], &[]);
        assert!(logs_contain("rejecting symbol batch"));
    }

    #[test]
    #[traced_test]
    fn malformed_row_is_logged() {
        engine().run(&[], &[], &[factor("BBB", 0, f64::INFINITY)]);
        assert!(logs_contain("skipping malformed row"));
    }

    #[test]
    fn malformed_factor_is_skipped_and_counted() {
        let factors = vec![
            factor("BBB", 0, f64::NAN),
            factor("BBB", 1, 1.2),
        ];
        let report = engine().run(&[], &[], &factors);

        assert_eq!(report.malformed_rows, 1);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].timestamp, ts(1));
    }

    #[test]
    fn malformed_bar_counts_once_even_with_several_rules() {
        struct AlsoBars;
        impl Rule for AlsoBars {
            fn name(&self) -> &'static str {
                "also_bars"
            }
            fn input(&self) -> RuleInput {
                RuleInput::Bars
            }
            fn evaluate(&self, row: RowRef<'_>, _: &RowContext) -> Result<Option<NewAlert>, RuleError> {
                match row {
                    RowRef::Bar(b) if !b.close.is_finite() => {
                        Err(RuleError::MalformedRow("close".into()))
                    }
                    _ => Ok(None),
                }
            }
        }

        let mut reg = RuleRegistry::reference(RuleConfig::default());
        reg.register(AlsoBars);
        let report = RuleEngine::new(reg).run(&bars("AAA", &[1.0, f64::NAN, 1.0]), &[], &[]);

        assert_eq!(report.malformed_rows, 1);
        assert_eq!(report.failures.len(), 2);
    }

    struct Exploding;

    impl Rule for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn input(&self) -> RuleInput {
            RuleInput::Factors
        }

        fn evaluate(&self, row: RowRef<'_>, _: &RowContext) -> Result<Option<NewAlert>, RuleError> {
            if row.symbol().as_str() == "BOOM" {
                panic!("boom");
            }
            Ok(None)
        }
    }

    #[test]
    fn panicking_rule_does_not_stop_other_rules() {
        let mut reg = RuleRegistry::reference(RuleConfig::default());
        reg.register(Exploding);

        let report = RuleEngine::new(reg).run(&[], &[], &[factor("BOOM", 0, 4.0)]);

        assert_eq!(report.faults(), 1);
        match &report.failures[0] {
            EngineError::RuleFault { rule, reason, .. } => {
                assert_eq!(rule, "exploding");
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // wide_spread still ran on the same row
        assert_eq!(report.alerts.len(), 1);
    }

    // ---------------------------------------------------------
    // Determinism, dedup
    // ---------------------------------------------------------

    #[test]
    fn output_is_sorted_by_symbol_timestamp_rule() {
        let factors = vec![
            factor("ZZZ", 0, 1.0),
            factor("AAA", 1, 1.0),
            factor("AAA", 0, 1.0),
        ];
        // AAA factors arrive out of order -> only ZZZ survives; fix order first
        let report = engine().run(&[], &[], &factors);
        assert_eq!(report.rejected_symbols, vec![Symbol::from("AAA")]);

        let factors = vec![
            factor("ZZZ", 0, 1.0),
            factor("AAA", 0, 1.0),
            factor("AAA", 1, 1.0),
        ];
        let report = engine().run(&[], &[], &factors);
        let keys: Vec<_> = report
            .alerts
            .iter()
            .map(|a| (a.symbol.as_str().to_string(), a.timestamp))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("AAA".to_string(), ts(0)),
                ("AAA".to_string(), ts(1)),
                ("ZZZ".to_string(), ts(0)),
            ]
        );
    }

    struct Duplicating;

    impl Rule for Duplicating {
        fn name(&self) -> &'static str {
            "wide_spread_shadow"
        }

        fn input(&self) -> RuleInput {
            RuleInput::Factors
        }

        fn evaluate(&self, row: RowRef<'_>, _: &RowContext) -> Result<Option<NewAlert>, RuleError> {
            // impersonates wide_spread's key
            Ok(Some(NewAlert::new(
                row.symbol().clone(),
                row.timestamp(),
                "wide_spread",
                0.0,
                Default::default(),
            )))
        }
    }

    #[test]
    fn duplicate_keys_within_a_run_are_suppressed() {
        let mut reg = RuleRegistry::reference(RuleConfig::default());
        reg.register(Duplicating);

        let report = RuleEngine::new(reg).run(&[], &[], &[factor("BBB", 0, 1.5)]);

        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.duplicates_suppressed, 1);
        // first registered rule wins
        assert_eq!(report.alerts[0].score, 1.5);
    }

    #[tokio::test]
    async fn partitioned_run_matches_sequential_run() {
        let mut all_bars = Vec::new();
        let mut all_factors = Vec::new();
        for (i, sym) in ["AAA", "BBB", "CCC", "DDD"].iter().enumerate() {
            let mut closes: Vec<f64> = (0..15).map(|k| 100.0 + (k % 3) as f64 * 0.01).collect();
            closes.push(150.0 + i as f64);
            all_bars.extend(bars(sym, &closes));
            all_factors.push(factor(sym, 0, 0.5 + i as f64 * 0.3));
        }

        let e = engine();
        let batch = Batch::from_rows(all_bars, vec![], all_factors);
        let sequential = e.run_batch(&batch);
        let partitioned = e.run_partitioned(batch).await;

        assert_eq!(sequential, partitioned);
        assert!(!sequential.alerts.is_empty());
    }

    #[test]
    fn rerunning_the_same_batch_is_identical() {
        let factors = vec![factor("BBB", 0, 1.5), factor("CCC", 0, 0.95)];
        let mut closes = vec![10.0; 12];
        closes.push(30.0);
        let b = bars("AAA", &closes);

        let first = engine().run(&b, &[], &factors);
        let second = engine().run(&b, &[], &factors);
        assert_eq!(first, second);
        assert_eq!(first.alerts.len(), 3);
    }
}

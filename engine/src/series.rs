//! Per-symbol partitioning of a batch.

use std::collections::{BTreeMap, BTreeSet};

use corelib::{Bar, Factor, Quote, Symbol, Timestamped};

use crate::error::EngineError;
use crate::rules::RuleInput;

/// Everything the engine knows about one symbol for one run.
///
/// Rows keep the order they arrived in; `validate_order` checks, it never sorts.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSeries {
    pub symbol: Symbol,
    pub bars: Vec<Bar>,
    pub quotes: Vec<Quote>,
    pub factors: Vec<Factor>,
}

impl SymbolSeries {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bars: Vec::new(),
            quotes: Vec::new(),
            factors: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.bars.len() + self.quotes.len() + self.factors.len()
    }

    /// Every series must be strictly ascending by timestamp (no duplicates).
    pub fn validate_order(&self) -> Result<(), EngineError> {
        self.validate_inputs(&BTreeSet::from([
            RuleInput::Bars,
            RuleInput::Quotes,
            RuleInput::Factors,
        ]))
    }

    /// Same check, restricted to the series in `inputs`.
    pub fn validate_inputs(&self, inputs: &BTreeSet<RuleInput>) -> Result<(), EngineError> {
        for input in inputs {
            match input {
                RuleInput::Bars => check_ascending(&self.symbol, *input, &self.bars)?,
                RuleInput::Quotes => check_ascending(&self.symbol, *input, &self.quotes)?,
                RuleInput::Factors => check_ascending(&self.symbol, *input, &self.factors)?,
            }
        }
        Ok(())
    }
}

fn check_ascending<T: Timestamped>(
    symbol: &Symbol,
    series: RuleInput,
    rows: &[T],
) -> Result<(), EngineError> {
    for (i, pair) in rows.windows(2).enumerate() {
        let (previous, current) = (pair[0].timestamp(), pair[1].timestamp());
        if current <= previous {
            return Err(EngineError::InputOrderingViolation {
                symbol: symbol.clone(),
                series,
                position: i + 1,
                previous,
                current,
            });
        }
    }
    Ok(())
}

/// A finite batch of rows grouped by symbol, iterated in symbol order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    series: BTreeMap<Symbol, SymbolSeries>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups rows by symbol, preserving arrival order within each symbol.
    pub fn from_rows(bars: Vec<Bar>, quotes: Vec<Quote>, factors: Vec<Factor>) -> Self {
        let mut batch = Self::new();
        for bar in bars {
            batch.entry(&bar.symbol).bars.push(bar);
        }
        for quote in quotes {
            batch.entry(&quote.symbol).quotes.push(quote);
        }
        for factor in factors {
            batch.entry(&factor.symbol).factors.push(factor);
        }
        batch
    }

    /// Inserts (or replaces) the series for `series.symbol`.
    pub fn insert(&mut self, series: SymbolSeries) {
        self.series.insert(series.symbol.clone(), series);
    }

    /// Puts `history` in front of each symbol's bars. Only symbols already in
    /// the batch receive history; `history` must be ascending per symbol and
    /// end before the batch's first bar.
    pub fn with_bar_history(mut self, history: Vec<Bar>) -> Self {
        let mut grouped: BTreeMap<Symbol, Vec<Bar>> = BTreeMap::new();
        for bar in history {
            grouped.entry(bar.symbol.clone()).or_default().push(bar);
        }

        for (symbol, mut bars) in grouped {
            if let Some(series) = self.series.get_mut(&symbol) {
                bars.append(&mut series.bars);
                series.bars = bars;
            }
        }
        self
    }

    fn entry(&mut self, symbol: &Symbol) -> &mut SymbolSeries {
        self.series
            .entry(symbol.clone())
            .or_insert_with(|| SymbolSeries::new(symbol.clone()))
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolSeries> {
        self.series.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.series.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolSeries> {
        self.series.values()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.series.values().map(SymbolSeries::row_count).sum()
    }
}

impl IntoIterator for Batch {
    type Item = SymbolSeries;
    type IntoIter = std::collections::btree_map::IntoValues<Symbol, SymbolSeries>;

    fn into_iter(self) -> Self::IntoIter {
        self.series.into_values()
    }
}

impl FromIterator<SymbolSeries> for Batch {
    fn from_iter<I: IntoIterator<Item = SymbolSeries>>(iter: I) -> Self {
        let mut batch = Self::new();
        for s in iter {
            batch.insert(s);
        }
        batch
    }
}

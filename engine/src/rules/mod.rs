//! Surveillance rules.
//!
//! A rule looks at exactly one row of one symbol (plus the windowed statistic
//! the engine prepared for that row, if the rule asked for one) and either
//! flags it or not. Rules hold only their configuration: no shared mutable
//! state, no dependency on other rules or on evaluation order.

pub mod return_spike;
pub mod wide_spread;

use std::fmt;

use chrono::{DateTime, Utc};
use corelib::{Bar, Factor, NewAlert, Quote, Symbol};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::returns::ReturnPoint;

pub use return_spike::ReturnSpikeRule;
pub use wide_spread::WideSpreadRule;

/// Which per-symbol series a rule consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleInput {
    Bars,
    Quotes,
    Factors,
}

impl fmt::Display for RuleInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleInput::Bars => "bars",
            RuleInput::Quotes => "quotes",
            RuleInput::Factors => "factors",
        })
    }
}

/// Borrowed view of the row under evaluation.
#[derive(Clone, Copy, Debug)]
pub enum RowRef<'a> {
    Bar(&'a Bar),
    Quote(&'a Quote),
    Factor(&'a Factor),
}

impl RowRef<'_> {
    pub fn symbol(&self) -> &Symbol {
        match self {
            RowRef::Bar(b) => &b.symbol,
            RowRef::Quote(q) => &q.symbol,
            RowRef::Factor(f) => &f.symbol,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RowRef::Bar(b) => b.timestamp,
            RowRef::Quote(q) => q.timestamp,
            RowRef::Factor(f) => f.timestamp,
        }
    }

    pub fn input(&self) -> RuleInput {
        match self {
            RowRef::Bar(_) => RuleInput::Bars,
            RowRef::Quote(_) => RuleInput::Quotes,
            RowRef::Factor(_) => RuleInput::Factors,
        }
    }
}

/// Per-row context prepared by the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RowContext {
    /// Position of the row within its symbol's series.
    pub position: usize,
    /// Return and trailing statistic, present only for bar rules that declared
    /// a return window.
    pub returns: Option<ReturnPoint>,
}

/// Evaluate-one-row contract shared by every rule.
pub trait Rule: Send + Sync {
    /// Stable identifier, persisted as the alert's `rule`.
    fn name(&self) -> &'static str;

    /// Series this rule is evaluated against.
    fn input(&self) -> RuleInput;

    /// Trailing window (in bars) of returns this rule needs, if any.
    fn return_window(&self) -> Option<usize> {
        None
    }

    /// Returns `Ok(Some(alert))` when the row is anomalous, `Ok(None)` when it
    /// is not or cannot be judged (undefined statistic).
    fn evaluate(&self, row: RowRef<'_>, ctx: &RowContext) -> Result<Option<NewAlert>, RuleError>;
}

/// Fixed thresholds for the reference rule set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleConfig {
    /// `spread_bp` strictly above this fires `wide_spread`.
    pub wide_spread_threshold: f64,
    /// `|z|` strictly above this fires `return_spike`.
    pub return_spike_threshold: f64,
    /// Trailing window, in bars, including the current one.
    pub return_window: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            wide_spread_threshold: 0.9,
            return_spike_threshold: 3.0,
            return_window: 11,
        }
    }
}

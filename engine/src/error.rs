use chrono::{DateTime, Utc};
use corelib::Symbol;
use thiserror::Error;

use crate::rules::RuleInput;

/// What a single rule can report about the row it was handed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error("rule fault: {0}")]
    Fault(String),
}

/// Failures recorded by the engine. None of these abort a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// A symbol's rows were not strictly ascending. The whole symbol is rejected.
    #[error(
        "{series} for {symbol} not strictly ascending at position {position}: {previous} then {current}"
    )]
    InputOrderingViolation {
        symbol: Symbol,
        series: RuleInput,
        position: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    /// A row was missing or carried a non-numeric required field. Row skipped.
    #[error("malformed {series} row for {symbol} at {timestamp} (rule {rule}): {reason}")]
    MalformedRow {
        symbol: Symbol,
        series: RuleInput,
        timestamp: DateTime<Utc>,
        rule: String,
        reason: String,
    },

    /// A rule errored or panicked on one row. That row/rule pair is skipped.
    #[error("rule {rule} faulted on {symbol} at {timestamp}: {reason}")]
    RuleFault {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        rule: String,
        reason: String,
    },

    /// A per-symbol worker did not complete.
    #[error("partition worker failed: {0}")]
    PartitionFailed(String),
}

impl EngineError {
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            EngineError::InputOrderingViolation { symbol, .. }
            | EngineError::MalformedRow { symbol, .. }
            | EngineError::RuleFault { symbol, .. } => Some(symbol),
            EngineError::PartitionFailed(_) => None,
        }
    }
}

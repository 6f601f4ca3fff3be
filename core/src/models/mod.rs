//! Market surveillance data model.
//!
//! Bars, quotes and factors are immutable observations keyed by
//! `(symbol, timestamp)`. Alerts are produced by the rule engine and only get
//! an `id` once the sink has persisted them.

mod alert;
mod market;

pub use alert::{Alert, AlertDetails, AlertKey, NewAlert};
pub use market::{Bar, Factor, Quote, Symbol, TimeRange, Timestamped, Trade};

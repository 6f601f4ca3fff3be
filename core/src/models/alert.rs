use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Symbol;

/// Structured key/value payload attached to an alert (`{"ret":..,"z":..}`).
pub type AlertDetails = Map<String, Value>;

/// Identity of an observation: one rule can flag one `(symbol, timestamp)` once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlertKey {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub rule: String,
}

/// Alert produced by the engine, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlert {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub rule: String,
    pub score: f64,
    pub details: AlertDetails,
}

impl NewAlert {
    pub fn new(
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        rule: impl Into<String>,
        score: f64,
        details: AlertDetails,
    ) -> Self {
        Self {
            symbol,
            timestamp,
            rule: rule.into(),
            score,
            details,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            rule: self.rule.clone(),
        }
    }

    /// Details rendered as compact JSON text, as exported in reports.
    pub fn details_text(&self) -> String {
        Value::Object(self.details.clone()).to_string()
    }
}

/// Persisted alert. `id` is owned by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub rule: String,
    pub score: f64,
    pub details: AlertDetails,
}

impl Alert {
    pub fn from_new(id: i64, alert: NewAlert) -> Self {
        Self {
            id,
            symbol: alert.symbol,
            timestamp: alert.timestamp,
            rule: alert.rule,
            score: alert.score,
            details: alert.details,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            rule: self.rule.clone(),
        }
    }
    pub fn details_text(&self) -> String {
        Value::Object(self.details.clone()).to_string()
    }
}

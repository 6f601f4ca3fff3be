use corelib::{AlertDetails, NewAlert};
use serde_json::json;

use super::{Rule, RuleInput, RowContext, RowRef};
use crate::error::RuleError;

pub const NAME: &str = "wide_spread";

/// Flags factor rows whose `spread_bp` is strictly above the threshold.
///
/// The comparison is done in whatever unit the factor transform emits;
/// the rule converts nothing.
pub struct WideSpreadRule {
    threshold: f64,
}

impl WideSpreadRule {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Rule for WideSpreadRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn input(&self) -> RuleInput {
        RuleInput::Factors
    }

    fn evaluate(&self, row: RowRef<'_>, _ctx: &RowContext) -> Result<Option<NewAlert>, RuleError> {
        let RowRef::Factor(factor) = row else {
            return Err(RuleError::Fault(format!("expected factor row, got {}", row.input())));
        };

        if !factor.spread_bp.is_finite() {
            return Err(RuleError::MalformedRow(format!(
                "non-finite spread_bp {}",
                factor.spread_bp
            )));
        }

        if factor.spread_bp <= self.threshold {
            return Ok(None);
        }

        let mut details = AlertDetails::new();
        details.insert("spread_bp".into(), json!(factor.spread_bp));

        Ok(Some(NewAlert::new(
            factor.symbol.clone(),
            factor.timestamp,
            NAME,
            factor.spread_bp,
            details,
        )))
    }
}

use corelib::{AlertDetails, NewAlert};
use serde_json::json;

use super::{Rule, RuleInput, RowContext, RowRef};
use crate::error::RuleError;

pub const NAME: &str = "return_spike";

/// Flags bars whose one-minute return sits more than `threshold` sample
/// standard deviations away from the trailing-window mean.
///
/// Rows where the return or the window statistic is undefined never fire.
pub struct ReturnSpikeRule {
    threshold: f64,
    window: usize,
}

impl ReturnSpikeRule {
    pub fn new(threshold: f64, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(1),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Rule for ReturnSpikeRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn input(&self) -> RuleInput {
        RuleInput::Bars
    }

    fn return_window(&self) -> Option<usize> {
        Some(self.window)
    }

    fn evaluate(&self, row: RowRef<'_>, ctx: &RowContext) -> Result<Option<NewAlert>, RuleError> {
        let RowRef::Bar(bar) = row else {
            return Err(RuleError::Fault(format!("expected bar row, got {}", row.input())));
        };

        if !bar.close.is_finite() {
            return Err(RuleError::MalformedRow(format!("non-finite close {}", bar.close)));
        }

        let Some(point) = ctx.returns else {
            return Err(RuleError::Fault("return window was not prepared".into()));
        };

        let (Some(ret), Some(z)) = (point.ret, point.z_score()) else {
            return Ok(None);
        };

        let score = z.abs();
        if score <= self.threshold {
            return Ok(None);
        }

        let mut details = AlertDetails::new();
        details.insert("ret".into(), json!(ret));
        details.insert("z".into(), json!(z));

        Ok(Some(NewAlert::new(
            bar.symbol.clone(),
            bar.timestamp,
            NAME,
            score,
            details,
        )))
    }
}

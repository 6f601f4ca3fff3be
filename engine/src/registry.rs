use std::collections::BTreeSet;
use std::sync::Arc;

use crate::rules::{ReturnSpikeRule, Rule, RuleConfig, RuleInput, WideSpreadRule};

/// Ordered set of rules the engine runs, unique by name.
#[derive(Default, Clone)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `wide_spread` + `return_spike` with the given thresholds.
    pub fn reference(config: RuleConfig) -> Self {
        let mut reg = Self::new();
        reg.register(WideSpreadRule::new(config.wide_spread_threshold));
        reg.register(ReturnSpikeRule::new(
            config.return_spike_threshold,
            config.return_window,
        ));
        reg
    }

    /// Register a rule. Replaces any existing rule with the same name.
    pub fn register<R: Rule + 'static>(&mut self, rule: R) {
        self.register_arc(Arc::new(rule));
    }

    pub fn register_arc(&mut self, rule: Arc<dyn Rule>) {
        match self.rules.iter_mut().find(|r| r.name() == rule.name()) {
            Some(slot) => *slot = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r.name() == name)
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Rules that consume `input`.
    pub fn for_input(&self, input: RuleInput) -> impl Iterator<Item = &Arc<dyn Rule>> {
        self.rules.iter().filter(move |r| r.input() == input)
    }

    /// Series consumed by at least one registered rule.
    pub fn inputs(&self) -> BTreeSet<RuleInput> {
        self.rules.iter().map(|r| r.input()).collect()
    }

    /// Bars of history a windowed rule needs before its first evaluated bar:
    /// `W - 1` earlier returns, plus the close preceding the earliest of them.
    pub fn bar_lookback(&self) -> usize {
        self.return_windows().last().copied().unwrap_or(0)
    }

    /// Distinct return windows requested by the registered rules.
    pub fn return_windows(&self) -> BTreeSet<usize> {
        self.rules.iter().filter_map(|r| r.return_window()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

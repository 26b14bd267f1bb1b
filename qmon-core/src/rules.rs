use tracing::{debug, trace};

use crate::model::{Alert, Reading, Rule};

/// Evaluates declarative threshold rules against a single reading.
///
/// Rules are independent: each one either fires or not, in declaration
/// order, and none suppresses another.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn evaluate(&self, reading: &Reading) -> Vec<Alert> {
        evaluate(reading, &self.rules)
    }
}

pub fn evaluate(reading: &Reading, rules: &[Rule]) -> Vec<Alert> {
    rules
        .iter()
        .filter_map(|rule| evaluate_rule(reading, rule))
        .collect()
}

/// A rule whose metric is absent from the reading is skipped, never fired.
pub fn evaluate_rule(reading: &Reading, rule: &Rule) -> Option<Alert> {
    let Some(observed) = reading.value(&rule.metric_path) else {
        trace!(target: "rules", rule = %rule.name, metric = %rule.metric_path, "metric absent, rule skipped");
        return None;
    };
    if !rule.condition.holds(observed, rule.threshold, rule.tolerance) {
        return None;
    }

    debug!(
        target: "rules",
        rule = %rule.name,
        metric = %rule.metric_path,
        observed,
        threshold = rule.threshold,
        "rule fired"
    );
    Some(Alert {
        rule_name: rule.name.clone(),
        severity: rule.severity,
        metric_path: rule.metric_path.clone(),
        observed_value: observed,
        threshold: rule.threshold,
        condition: rule.condition,
        message: format!(
            "{metric} is {observed} ({condition} threshold {threshold})",
            metric = rule.metric_path,
            observed = format_value(observed),
            condition = rule.condition,
            threshold = format_value(rule.threshold),
        ),
        timestamp: reading.timestamp,
    })
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        let text = format!("{value:.4}");
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

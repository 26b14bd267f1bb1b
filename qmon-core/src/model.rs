use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix under which rules and trends address `Reading::system_stats`.
pub const SYSTEM_PREFIX: &str = "system.";

/// One row of the monitored time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub system_stats: BTreeMap<String, f64>,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            metrics: BTreeMap::new(),
            system_stats: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, path: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(path.into(), value);
        self
    }

    pub fn with_system_stat(mut self, name: impl Into<String>, value: f64) -> Self {
        self.system_stats.insert(name.into(), value);
        self
    }

    /// Resolves a dotted metric path. Paths under `system.` fall through to
    /// the resource counters when no metric of that exact name exists.
    pub fn value(&self, path: &str) -> Option<f64> {
        if let Some(value) = self.metrics.get(path) {
            return Some(*value);
        }
        path.strip_prefix(SYSTEM_PREFIX)
            .and_then(|name| self.system_stats.get(name))
            .copied()
    }

    /// Every addressable path in this reading, system stats included.
    pub fn paths(&self) -> impl Iterator<Item = String> + '_ {
        self.metrics.keys().cloned().chain(
            self.system_stats
                .keys()
                .map(|name| format!("{SYSTEM_PREFIX}{name}")),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Below,
    Above,
    Equals,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Below => "below",
            Condition::Above => "above",
            Condition::Equals => "equals",
        }
    }

    /// `tolerance` only widens `Equals`; zero keeps the exact-match semantics.
    pub fn holds(&self, observed: f64, threshold: f64, tolerance: f64) -> bool {
        match self {
            Condition::Below => observed < threshold,
            Condition::Above => observed > threshold,
            Condition::Equals => {
                if tolerance > 0.0 {
                    (observed - threshold).abs() <= tolerance
                } else {
                    observed == threshold
                }
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "below" => Ok(Condition::Below),
            "above" => Ok(Condition::Above),
            "equals" => Ok(Condition::Equals),
            other => Err(format!("unknown condition: {other}")),
        }
    }
}

/// Declarative threshold check over one metric. Defined in configuration and
/// never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub metric_path: String,
    pub condition: Condition,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default)]
    pub tolerance: f64,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        metric_path: impl Into<String>,
        condition: Condition,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            metric_path: metric_path.into(),
            condition,
            threshold,
            severity,
            tolerance: 0.0,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// A fired rule against one specific reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub rule_name: String,
    pub severity: Severity,
    pub metric_path: String,
    pub observed_value: f64,
    pub threshold: f64,
    pub condition: Condition,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn title(&self) -> String {
        format!("[qmon][{}] {}", self.severity, self.rule_name)
    }

    pub fn body(&self) -> String {
        format!(
            "{message}\nMetric: {metric}\nObserved: {observed}\nThreshold: {condition} {threshold}\nTime: {time}",
            message = self.message,
            metric = self.metric_path,
            observed = self.observed_value,
            condition = self.condition,
            threshold = self.threshold,
            time = self.timestamp.to_rfc3339(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_falls_back_to_system_stats() {
        let reading = Reading::new(Utc::now())
            .with_metric("uat.successRate", 0.9)
            .with_system_stat("memoryMb", 512.0);
        assert_eq!(reading.value("uat.successRate"), Some(0.9));
        assert_eq!(reading.value("system.memoryMb"), Some(512.0));
        assert_eq!(reading.value("memoryMb"), None);
        assert_eq!(reading.value("uat.missing"), None);
    }

    #[test]
    fn equals_is_exact_without_tolerance() {
        assert!(Condition::Equals.holds(1.0, 1.0, 0.0));
        assert!(!Condition::Equals.holds(0.1 + 0.2, 0.3, 0.0));
        assert!(Condition::Equals.holds(0.1 + 0.2, 0.3, 1e-9));
    }

    #[test]
    fn condition_and_severity_parse() {
        assert_eq!("below".parse::<Condition>().unwrap(), Condition::Below);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("between".parse::<Condition>().is_err());
    }

    #[test]
    fn reading_serializes_camel_case() {
        let reading = Reading::new(Utc::now()).with_system_stat("uptimeSeconds", 3.0);
        let json = serde_json::to_value(&reading).unwrap();
        assert!(json.get("systemStats").is_some());
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Reading, SYSTEM_PREFIX};

/// Percentage change beyond which a metric counts as moving.
pub const TREND_THRESHOLD_PCT: f64 = 5.0;
/// Relative growth beyond which memory counts as growing.
pub const MEMORY_GROWTH_RATIO: f64 = 0.2;
/// Relative shrink beyond which memory counts as optimized.
pub const MEMORY_SHRINK_RATIO: f64 = -0.1;
/// Resource counter used for the dedicated memory check.
pub const MEMORY_METRIC: &str = "system.memoryMb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Trend::Improving => "improving",
            Trend::Stable => "stable",
            Trend::Declining => "declining",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryTrend {
    MemoryGrowing,
    MemoryOptimized,
    Stable,
}

impl fmt::Display for MemoryTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MemoryTrend::MemoryGrowing => "memory-growing",
            MemoryTrend::MemoryOptimized => "memory-optimized",
            MemoryTrend::Stable => "stable",
        };
        f.write_str(label)
    }
}

/// Direction of every tracked metric over one window. Recomputed on each
/// pass and never persisted outside a report snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendResult {
    pub metrics: BTreeMap<String, Trend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryTrend>,
}

impl TrendResult {
    /// Looks a metric up either by its dotted path or by its trend key.
    pub fn get(&self, metric: &str) -> Option<Trend> {
        self.metrics
            .get(metric)
            .or_else(|| self.metrics.get(&trend_key(metric)))
            .copied()
    }
}

/// `uat.successRate` → `uatSuccessRate`.
pub fn trend_key(path: &str) -> String {
    let mut key = String::with_capacity(path.len());
    for (index, segment) in path.split('.').filter(|s| !s.is_empty()).enumerate() {
        if index == 0 {
            key.push_str(segment);
            continue;
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            key.extend(first.to_uppercase());
            key.push_str(chars.as_str());
        }
    }
    key
}

/// Relative percentage change, `None` when `first` is zero.
pub fn pct_change(first: f64, last: f64) -> Option<f64> {
    if first == 0.0 {
        None
    } else {
        Some((last - first) / first * 100.0)
    }
}

pub fn classify(first: f64, last: f64) -> Trend {
    match pct_change(first, last) {
        Some(change) if change > TREND_THRESHOLD_PCT => Trend::Improving,
        Some(change) if change < -TREND_THRESHOLD_PCT => Trend::Declining,
        _ => Trend::Stable,
    }
}

pub fn classify_memory(first: f64, last: f64) -> MemoryTrend {
    if first == 0.0 {
        return MemoryTrend::Stable;
    }
    let growth = (last - first) / first;
    if growth > MEMORY_GROWTH_RATIO {
        MemoryTrend::MemoryGrowing
    } else if growth < MEMORY_SHRINK_RATIO {
        MemoryTrend::MemoryOptimized
    } else {
        MemoryTrend::Stable
    }
}

/// First and last present values of `path` across the window.
fn endpoints(window: &[Reading], path: &str) -> Option<(f64, f64)> {
    let mut values = window.iter().filter_map(|reading| reading.value(path));
    let first = values.next()?;
    let last = values.last()?;
    Some((first, last))
}

#[derive(Debug, Clone, Default)]
pub struct TrendAnalyzer {
    tracked: Vec<String>,
}

impl TrendAnalyzer {
    /// `tracked` metrics are always reported, even when absent from the
    /// window; every metric that does appear in the window is reported too.
    /// Resource counters under `system.` never get a success-rate trend.
    pub fn new(tracked: Vec<String>) -> Self {
        Self { tracked }
    }

    pub fn analyze(&self, window: &[Reading]) -> TrendResult {
        let mut paths: Vec<String> = self.tracked.clone();
        paths.extend(window.iter().flat_map(|reading| reading.metrics.keys().cloned()));
        paths.retain(|path| !path.starts_with(SYSTEM_PREFIX));
        paths.sort();
        paths.dedup();

        let mut metrics = BTreeMap::new();
        for path in paths {
            let trend = endpoints(window, &path)
                .map(|(first, last)| classify(first, last))
                .unwrap_or(Trend::Stable);
            metrics.insert(trend_key(&path), trend);
        }

        let memory = endpoints(window, MEMORY_METRIC)
            .map(|(first, last)| classify_memory(first, last))
            .or_else(|| {
                window
                    .iter()
                    .any(|reading| reading.value(MEMORY_METRIC).is_some())
                    .then_some(MemoryTrend::Stable)
            });

        TrendResult { metrics, memory }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn series(path: &str, values: &[Option<f64>]) -> Vec<Reading> {
        let start = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let reading = Reading::new(start + Duration::seconds(i as i64));
                match value {
                    Some(v) => reading.with_metric(path, *v),
                    None => reading,
                }
            })
            .collect()
    }

    #[test]
    fn keys_are_camel_cased() {
        assert_eq!(trend_key("uat.successRate"), "uatSuccessRate");
        assert_eq!(trend_key("performance.score"), "performanceScore");
        assert_eq!(trend_key("single"), "single");
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(100.0, 105.0), Trend::Stable);
        assert_eq!(classify(100.0, 105.1), Trend::Improving);
        assert_eq!(classify(100.0, 94.9), Trend::Declining);
        assert_eq!(classify(0.0, 50.0), Trend::Stable);
        assert_eq!(classify(1.0, 1.2), classify(1000.0, 1200.0));
    }

    #[test]
    fn memory_thresholds_are_asymmetric() {
        assert_eq!(classify_memory(100.0, 121.0), MemoryTrend::MemoryGrowing);
        assert_eq!(classify_memory(100.0, 119.0), MemoryTrend::Stable);
        assert_eq!(classify_memory(100.0, 89.0), MemoryTrend::MemoryOptimized);
        assert_eq!(classify_memory(100.0, 91.0), MemoryTrend::Stable);
        assert_eq!(classify_memory(0.0, 500.0), MemoryTrend::Stable);
    }

    #[test]
    fn absent_values_are_skipped() {
        let window = series("uat.successRate", &[None, Some(0.5), None, Some(0.8), None]);
        let result = TrendAnalyzer::default().analyze(&window);
        assert_eq!(result.get("uat.successRate"), Some(Trend::Improving));
    }

    #[test]
    fn single_value_is_stable() {
        let window = series("uat.successRate", &[None, Some(0.5)]);
        let result = TrendAnalyzer::new(vec!["perf.score".into()]).analyze(&window);
        assert_eq!(result.get("uatSuccessRate"), Some(Trend::Stable));
        assert_eq!(result.get("perf.score"), Some(Trend::Stable));
        assert!(result.memory.is_none());
    }

    #[test]
    fn memory_trend_uses_system_stats() {
        let start = Utc::now();
        let window = vec![
            Reading::new(start).with_system_stat("memoryMb", 100.0),
            Reading::new(start + Duration::seconds(1)).with_system_stat("memoryMb", 150.0),
        ];
        let result = TrendAnalyzer::default().analyze(&window);
        assert_eq!(result.memory, Some(MemoryTrend::MemoryGrowing));
    }

    #[test]
    fn tracked_memory_counter_stays_out_of_metric_trends() {
        let start = Utc::now();
        let window = vec![
            Reading::new(start)
                .with_metric("uat.successRate", 0.9)
                .with_system_stat("memoryMb", 100.0),
            Reading::new(start + Duration::seconds(1))
                .with_metric("uat.successRate", 0.9)
                .with_system_stat("memoryMb", 150.0),
        ];
        let tracked = crate::config::MonitoringConfig::default().tracked_metrics();
        assert!(tracked.iter().any(|path| path == MEMORY_METRIC));

        let result = TrendAnalyzer::new(tracked).analyze(&window);
        assert!(!result.metrics.contains_key("systemMemoryMb"));
        assert!(result.metrics.keys().all(|key| !key.starts_with("system")));
        assert_eq!(result.get(MEMORY_METRIC), None);
        assert_eq!(result.get("uat.successRate"), Some(Trend::Stable));
        assert_eq!(result.memory, Some(MemoryTrend::MemoryGrowing));
    }
}

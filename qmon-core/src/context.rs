use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collector::CollectionFailure;
use crate::config::{BandStatus, MonitoringConfig};
use crate::dispatcher::DispatchReport;
use crate::model::{Alert, Reading};
use crate::trend::TrendResult;

/// Everything one monitoring cycle produced, passed by value from stage to
/// stage. Each stage consumes the context and returns an extended one.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringContext {
    pub tag: String,
    pub started_at: DateTime<Utc>,
    pub reading: Option<Reading>,
    pub collection_failures: Vec<CollectionFailure>,
    pub pruned: usize,
    pub history_len: usize,
    pub trends: TrendResult,
    pub alerts: Vec<Alert>,
    pub dispatch: DispatchReport,
    pub threshold_status: BTreeMap<String, BandStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl MonitoringContext {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            started_at: Utc::now(),
            reading: None,
            collection_failures: Vec::new(),
            pruned: 0,
            history_len: 0,
            trends: TrendResult::default(),
            alerts: Vec::new(),
            dispatch: DispatchReport::default(),
            threshold_status: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_failures(mut self, failures: Vec<CollectionFailure>) -> Self {
        self.collection_failures = failures;
        self
    }

    /// Replaces the collected reading with the copy the history stored,
    /// which may carry an adjusted timestamp.
    pub fn with_stored(mut self, stored: Reading, pruned: usize, history_len: usize) -> Self {
        self.reading = Some(stored);
        self.pruned = pruned;
        self.history_len = history_len;
        self
    }

    pub fn with_trends(mut self, trends: TrendResult) -> Self {
        self.trends = trends;
        self
    }

    pub fn with_alerts(mut self, alerts: Vec<Alert>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchReport) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_threshold_status(mut self, status: BTreeMap<String, BandStatus>) -> Self {
        self.threshold_status = status;
        self
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Band status for every configured threshold whose metric is present.
pub fn threshold_status(config: &MonitoringConfig, reading: &Reading) -> BTreeMap<String, BandStatus> {
    config
        .thresholds
        .iter()
        .filter_map(|(path, band)| reading.value(path).map(|value| (path.clone(), band.status(value))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_status_skips_absent_metrics() {
        let config = MonitoringConfig::default();
        let reading = Reading::new(Utc::now())
            .with_metric("uat.successRate", 0.6)
            .with_system_stat("memoryMb", 2048.0);
        let status = threshold_status(&config, &reading);
        assert_eq!(status.get("uat.successRate"), Some(&BandStatus::Warning));
        assert_eq!(status.get("system.memoryMb"), Some(&BandStatus::Critical));
        assert!(!status.contains_key("performance.score"));
    }
}

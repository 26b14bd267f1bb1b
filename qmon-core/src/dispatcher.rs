use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MonitoringConfig;
use crate::history::write_atomic;
use crate::model::Alert;
use crate::notify::{channel_from_settings, NotificationChannel};

const ALERT_LOG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum AlertLogError {
    #[error("io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one alert on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDelivery {
    pub channel: String,
    pub rule_name: String,
    pub result: Result<(), String>,
}

impl ChannelDelivery {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Alerts actually routed after deduplication.
    pub dispatched: usize,
    /// Alerts dropped as duplicates within the batch.
    pub duplicates: usize,
    pub deliveries: Vec<ChannelDelivery>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.deliveries.iter().filter(|d| d.is_delivered()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChannelDelivery> {
        self.deliveries.iter().filter(|d| !d.is_delivered())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertLogEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub alert: Alert,
    pub delivered_to: Vec<String>,
    pub failed_channels: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AlertLogFile {
    version: u32,
    entries: Vec<AlertLogEntry>,
}

/// Append-only JSON ledger of dispatched alerts, bounded by its own
/// retention window.
#[derive(Debug)]
pub struct AlertLog {
    path: PathBuf,
    retention_days: u32,
    lock: Mutex<()>,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            path: path.into(),
            retention_days,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries currently on disk. A missing or corrupt log reads as empty.
    pub fn entries(&self) -> Vec<AlertLogEntry> {
        match read_log(&self.path) {
            Ok(entries) => entries,
            Err(AlertLogError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Vec::new()
            }
            Err(err) => {
                warn!(target: "alerts", path = %self.path.display(), error = %err, "unreadable alert log, starting empty");
                Vec::new()
            }
        }
    }

    /// Appends `new_entries` and drops entries older than the retention
    /// window. Returns the number of entries removed.
    pub fn record(
        &self,
        new_entries: Vec<AlertLogEntry>,
        now: DateTime<Utc>,
    ) -> Result<usize, AlertLogError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries = self.entries();
        entries.extend(new_entries);

        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let before = entries.len();
        entries.retain(|entry| entry.recorded_at >= cutoff);
        let removed = before - entries.len();

        let file = AlertLogFile {
            version: ALERT_LOG_VERSION,
            entries,
        };
        let content = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &content).map_err(|source| AlertLogError::Io {
            source,
            path: self.path.clone(),
        })?;
        if removed > 0 {
            debug!(target: "alerts", removed, "pruned expired alert log entries");
        }
        Ok(removed)
    }
}

fn read_log(path: &Path) -> Result<Vec<AlertLogEntry>, AlertLogError> {
    let content = std::fs::read_to_string(path).map_err(|source| AlertLogError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let file: AlertLogFile = serde_json::from_str(&content)?;
    Ok(file.entries)
}

/// Routes fired alerts to every enabled channel. Delivery is best effort:
/// a failing channel is reported and logged, never propagated.
pub struct AlertDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    alert_log: Option<AlertLog>,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.channels.iter().map(|c| c.name()).collect();
        f.debug_struct("AlertDispatcher")
            .field("channels", &names)
            .field("alert_log", &self.alert_log)
            .finish()
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            alert_log: None,
        }
    }

    /// Builds every enabled channel. A channel that cannot be constructed is
    /// logged and left out; the others still receive alerts.
    pub fn from_config(config: &MonitoringConfig) -> Self {
        let mut dispatcher = Self::new().with_alert_log(AlertLog::new(
            config.alert_log_path(),
            config.alert_log_retention_days,
        ));
        for (name, settings) in config.enabled_channels() {
            match channel_from_settings(name, settings) {
                Ok(channel) => dispatcher.channels.push(Arc::from(channel)),
                Err(err) => {
                    error!(target: "alerts", channel = %name, error = %err, "channel disabled: cannot be built")
                }
            }
        }
        dispatcher
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_alert_log(mut self, log: AlertLog) -> Self {
        self.alert_log = Some(log);
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn alert_log(&self) -> Option<&AlertLog> {
        self.alert_log.as_ref()
    }

    pub async fn dispatch(&self, alerts: &[Alert]) -> DispatchReport {
        let mut seen = HashSet::new();
        let unique: Vec<&Alert> = alerts
            .iter()
            .filter(|&alert| seen.insert((alert.rule_name.as_str(), alert.metric_path.as_str())))
            .collect();
        let duplicates = alerts.len() - unique.len();

        let mut report = DispatchReport {
            dispatched: unique.len(),
            duplicates,
            deliveries: Vec::new(),
        };
        if unique.is_empty() {
            return report;
        }
        if self.channels.is_empty() {
            warn!(target: "alerts", alerts = unique.len(), "alerts fired but no channel is enabled");
        }

        let attempts = unique.iter().flat_map(|alert| {
            self.channels
                .iter()
                .map(move |channel| self.deliver(channel.as_ref(), alert))
        });
        report.deliveries = join_all(attempts).await;

        info!(
            target: "alerts",
            alerts = report.dispatched,
            delivered = report.delivered(),
            failed = report.deliveries.len() - report.delivered(),
            "alerts dispatched"
        );

        if let Some(log) = &self.alert_log {
            let now = Utc::now();
            let entries = unique
                .iter()
                .map(|alert| log_entry(alert, &report.deliveries, now))
                .collect();
            if let Err(err) = log.record(entries, now) {
                warn!(target: "alerts", path = %log.path().display(), error = %err, "failed to append alert log");
            }
        }
        report
    }

    async fn deliver(&self, channel: &dyn NotificationChannel, alert: &Alert) -> ChannelDelivery {
        let result = channel
            .send(&alert.title(), &alert.body(), alert.severity)
            .await
            .map_err(|err| {
                error!(
                    target: "alerts",
                    channel = channel.name(),
                    rule = %alert.rule_name,
                    error = %err,
                    "failed to send alert"
                );
                err.to_string()
            });
        ChannelDelivery {
            channel: channel.name().to_string(),
            rule_name: alert.rule_name.clone(),
            result,
        }
    }
}

fn log_entry(alert: &Alert, deliveries: &[ChannelDelivery], now: DateTime<Utc>) -> AlertLogEntry {
    let (delivered, failed): (Vec<&ChannelDelivery>, Vec<&ChannelDelivery>) = deliveries
        .iter()
        .filter(|d| d.rule_name == alert.rule_name)
        .partition(|d| d.is_delivered());
    AlertLogEntry {
        id: Uuid::new_v4(),
        recorded_at: now,
        alert: alert.clone(),
        delivered_to: delivered.into_iter().map(|d| d.channel.clone()).collect(),
        failed_channels: failed.into_iter().map(|d| d.channel.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Condition, Severity};
    use crate::notify::ChannelError;
    use async_trait::async_trait;

    struct Recording {
        name: &'static str,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationChannel for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, title: &str, _body: &str, _severity: Severity) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    fn alert(rule: &str) -> Alert {
        Alert {
            rule_name: rule.into(),
            severity: Severity::Warning,
            metric_path: "uat.successRate".into(),
            observed_value: 0.6,
            threshold: 0.75,
            condition: Condition::Below,
            message: "uat.successRate is 0.6 (below threshold 0.75)".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicates_within_batch_are_sent_once() {
        let channel = Arc::new(Recording {
            name: "rec",
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = AlertDispatcher::new().with_channel(channel.clone());
        let report = dispatcher
            .dispatch(&[alert("low"), alert("low"), alert("other")])
            .await;
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(
            *channel.sent.lock().unwrap(),
            vec!["[qmon][warning] low".to_string(), "[qmon][warning] other".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert-log.json");
        let dispatcher = AlertDispatcher::new().with_alert_log(AlertLog::new(&path, 7));
        let report = dispatcher.dispatch(&[]).await;
        assert!(report.deliveries.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn alert_log_prunes_by_retention() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path().join("alert-log.json"), 7);
        let now = Utc::now();
        let entry = |recorded_at| AlertLogEntry {
            id: Uuid::new_v4(),
            recorded_at,
            alert: alert("low"),
            delivered_to: vec!["console".into()],
            failed_channels: Vec::new(),
        };
        log.record(vec![entry(now - Duration::days(10))], now - Duration::days(10))
            .unwrap();
        let removed = log.record(vec![entry(now)], now).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn corrupt_alert_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert-log.json");
        std::fs::write(&path, "[[[").unwrap();
        assert!(AlertLog::new(&path, 7).entries().is_empty());
    }
}

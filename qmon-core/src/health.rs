use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::MonitoringConfig;
use crate::history::{HistoryError, HistoryStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub healthy: bool,
    pub reason: String,
}

impl CheckResult {
    fn healthy(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            reason: reason.into(),
        }
    }

    fn unhealthy(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub healthy: bool,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        Self {
            checked_at: Utc::now(),
            healthy: checks.iter().all(|check| check.healthy),
            checks,
        }
    }
}

/// Validates collaborator reachability. Never reads metrics, never touches
/// the rule engine, and only reads the history file.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    config: Arc<MonitoringConfig>,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(config: Arc<MonitoringConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.health.timeout_seconds.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub async fn run(&self) -> HealthReport {
        let mut checks = vec![
            self.check_config(),
            self.check_history(),
            self.check_reports_dir(),
            self.check_framework().await,
        ];
        checks.extend(
            self.config
                .health
                .expected_files
                .iter()
                .map(|file| self.check_report_file(file)),
        );

        for check in checks.iter().filter(|c| !c.healthy) {
            warn!(target: "health", check = %check.name, reason = %check.reason, "health check failed");
        }
        let report = HealthReport::from_checks(checks);
        info!(
            target: "health",
            healthy = report.healthy,
            checks = report.checks.len(),
            "health check completed"
        );
        report
    }

    fn check_config(&self) -> CheckResult {
        match self.config.validate() {
            Ok(()) => CheckResult::healthy(
                "config",
                format!(
                    "{} rules, {} enabled channels",
                    self.config.alert_rules.len(),
                    self.config.enabled_channels().count()
                ),
            ),
            Err(reason) => CheckResult::unhealthy("config", reason),
        }
    }

    fn check_history(&self) -> CheckResult {
        let path = self.config.history_path();
        if !path.exists() {
            return CheckResult::healthy("history", "no history recorded yet");
        }
        match HistoryStore::load(&path) {
            Ok(readings) => CheckResult::healthy("history", format!("{} readings", readings.len())),
            Err(HistoryError::Serialize(err)) => {
                CheckResult::unhealthy("history", format!("corrupt history file: {err}"))
            }
            Err(err) => CheckResult::unhealthy("history", err.to_string()),
        }
    }

    fn check_reports_dir(&self) -> CheckResult {
        let dir = self.config.reports_dir();
        match probe_writable(&dir) {
            Ok(()) => CheckResult::healthy("reports-dir", format!("{} writable", dir.display())),
            Err(err) => CheckResult::unhealthy(
                "reports-dir",
                format!("{} not writable: {err}", dir.display()),
            ),
        }
    }

    async fn check_framework(&self) -> CheckResult {
        let Some(url) = &self.config.health.framework_url else {
            return CheckResult::healthy("framework", "not configured");
        };
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                CheckResult::healthy("framework", format!("HTTP {}", response.status().as_u16()))
            }
            Ok(response) => {
                CheckResult::unhealthy("framework", format!("HTTP {}", response.status().as_u16()))
            }
            Err(err) if err.is_timeout() => CheckResult::unhealthy(
                "framework",
                format!("no response within {}s", self.config.health.timeout_seconds),
            ),
            Err(err) if err.is_connect() => {
                CheckResult::unhealthy("framework", format!("{url} unreachable"))
            }
            Err(err) => CheckResult::unhealthy("framework", err.to_string()),
        }
    }

    fn check_report_file(&self, file: &str) -> CheckResult {
        let name = format!("report-file:{file}");
        let path = self.config.resolve_path(file);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => CheckResult::healthy(name, "present"),
            Ok(_) => CheckResult::unhealthy(name, format!("{} is not a file", path.display())),
            Err(_) => CheckResult::unhealthy(name, format!("{} missing", path.display())),
        }
    }
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    tempfile::NamedTempFile::new_in(dir)?;
    Ok(())
}

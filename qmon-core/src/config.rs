use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::model::{Condition, Rule, Severity};

/// Process-wide monitoring configuration. Loaded once at startup and shared
/// read-only for the life of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_alert_log_retention_days")]
    pub alert_log_retention_days: u32,
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub intervals: IntervalsSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdBand>,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelSettings>,
    #[serde(default)]
    pub alert_rules: Vec<Rule>,
    #[serde(default)]
    pub producers: Vec<ProducerSettings>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_alert_log_retention_days() -> u32 {
    7
}

fn default_trend_window() -> usize {
    10
}

impl MonitoringConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.history_file)
    }

    pub fn alert_log_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.alert_log_file)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.reports_dir)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = (&String, &ChannelSettings)> {
        self.channels.iter().filter(|(_, settings)| settings.enabled)
    }

    /// Metric paths the trend analyzer should always report on, even when a
    /// window happens not to contain them.
    pub fn tracked_metrics(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .alert_rules
            .iter()
            .map(|rule| rule.metric_path.clone())
            .chain(self.thresholds.keys().cloned())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.retention_days == 0 {
            return Err("retention_days must be greater than zero".into());
        }
        if self.alert_log_retention_days == 0 {
            return Err("alert_log_retention_days must be greater than zero".into());
        }
        if self.trend_window < 2 {
            return Err("trend_window must cover at least two readings".into());
        }
        if self.intervals.quick_seconds == 0 || self.intervals.full_seconds == 0 {
            return Err("intervals must be greater than zero".into());
        }

        let mut rule_names = HashSet::new();
        for rule in &self.alert_rules {
            if rule.name.trim().is_empty() {
                return Err("alert rule with empty name".into());
            }
            if !rule_names.insert(rule.name.as_str()) {
                return Err(format!("duplicate alert rule `{}`", rule.name));
            }
            if !valid_metric_path(&rule.metric_path) {
                return Err(format!(
                    "alert rule `{}` has malformed metric path `{}`",
                    rule.name, rule.metric_path
                ));
            }
            if !rule.threshold.is_finite() {
                return Err(format!("alert rule `{}` has a non-finite threshold", rule.name));
            }
            if !rule.tolerance.is_finite() || rule.tolerance < 0.0 {
                return Err(format!(
                    "alert rule `{}` tolerance must be a non-negative number",
                    rule.name
                ));
            }
        }

        for (path, band) in &self.thresholds {
            if !valid_metric_path(path) {
                return Err(format!("threshold for malformed metric path `{path}`"));
            }
            if !band.warning.is_finite() || !band.critical.is_finite() {
                return Err(format!("threshold for `{path}` must be finite"));
            }
        }

        for (name, channel) in self.enabled_channels() {
            channel
                .validate()
                .map_err(|reason| format!("channel `{name}`: {reason}"))?;
        }

        let mut producer_names = HashSet::new();
        for producer in &self.producers {
            if producer.name.trim().is_empty() || producer.name.contains('.') {
                return Err(format!("invalid producer name `{}`", producer.name));
            }
            if producer.name == "system" {
                return Err("producer name `system` is reserved".into());
            }
            if !producer_names.insert(producer.name.as_str()) {
                return Err(format!("duplicate producer `{}`", producer.name));
            }
            producer
                .validate()
                .map_err(|reason| format!("producer `{}`: {reason}", producer.name))?;
        }

        if let Some(url) = &self.health.framework_url {
            url::Url::parse(url).map_err(|err| format!("health.framework_url: {err}"))?;
        }
        Ok(())
    }
}

fn valid_metric_path(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(|segment| !segment.trim().is_empty())
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("uat.successRate".to_string(), ThresholdBand::new(0.75, 0.5));
        thresholds.insert("smoke.successRate".to_string(), ThresholdBand::new(0.9, 0.75));
        thresholds.insert("performance.score".to_string(), ThresholdBand::new(70.0, 50.0));
        thresholds.insert("system.memoryMb".to_string(), ThresholdBand::new(512.0, 1024.0));

        let mut channels = BTreeMap::new();
        channels.insert(
            "console".to_string(),
            ChannelSettings::new(ChannelKind::Console, true),
        );
        channels.insert(
            "webhook".to_string(),
            ChannelSettings::new(ChannelKind::Webhook, false),
        );
        channels.insert(
            "email".to_string(),
            ChannelSettings {
                smtp_port: Some(587),
                ..ChannelSettings::new(ChannelKind::Email, false)
            },
        );

        Self {
            retention_days: default_retention_days(),
            alert_log_retention_days: default_alert_log_retention_days(),
            trend_window: default_trend_window(),
            paths: PathsSection::default(),
            intervals: IntervalsSection::default(),
            health: HealthSection::default(),
            thresholds,
            channels,
            alert_rules: vec![
                Rule::new(
                    "uat-success-rate-low",
                    "uat.successRate",
                    Condition::Below,
                    0.75,
                    Severity::Warning,
                ),
                Rule::new(
                    "uat-success-rate-critical",
                    "uat.successRate",
                    Condition::Below,
                    0.5,
                    Severity::Critical,
                ),
                Rule::new(
                    "smoke-success-rate-low",
                    "smoke.successRate",
                    Condition::Below,
                    0.9,
                    Severity::Warning,
                ),
                Rule::new(
                    "performance-score-low",
                    "performance.score",
                    Condition::Below,
                    50.0,
                    Severity::Warning,
                ),
                Rule::new(
                    "memory-high",
                    "system.memoryMb",
                    Condition::Above,
                    1024.0,
                    Severity::Warning,
                ),
            ],
            producers: vec![
                ProducerSettings {
                    path: Some("test-results/smoke.json".into()),
                    ..ProducerSettings::new("smoke", ProducerKind::ReportFile, ProducerDepth::Quick)
                },
                ProducerSettings {
                    url: Some("http://localhost:3000/".into()),
                    target_latency_ms: Some(200.0),
                    timeout_seconds: Some(10),
                    ..ProducerSettings::new("performance", ProducerKind::Http, ProducerDepth::Quick)
                },
                ProducerSettings {
                    command: Some("npm".into()),
                    args: vec!["run".into(), "test:uat".into(), "--silent".into()],
                    timeout_seconds: Some(900),
                    ..ProducerSettings::new("uat", ProducerKind::Command, ProducerDepth::Full)
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub history_file: String,
    pub alert_log_file: String,
    pub reports_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            data_dir: "monitoring".into(),
            history_file: "history.json".into(),
            alert_log_file: "alert-log.json".into(),
            reports_dir: "reports".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalsSection {
    pub quick_seconds: u64,
    pub full_seconds: u64,
}

impl IntervalsSection {
    pub fn quick(&self) -> Duration {
        Duration::from_secs(self.quick_seconds)
    }

    pub fn full(&self) -> Duration {
        Duration::from_secs(self.full_seconds)
    }
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            quick_seconds: 300,
            full_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_url: Option<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            framework_url: Some("http://localhost:3000/".into()),
            expected_files: vec!["test-results/smoke.json".into()],
            timeout_seconds: default_health_timeout(),
        }
    }
}

/// Display bounds for one metric. A band whose warning bound sits above its
/// critical bound treats lower values as worse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub warning: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandStatus {
    Ok,
    Warning,
    Critical,
}

impl ThresholdBand {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    pub fn lower_is_worse(&self) -> bool {
        self.warning > self.critical
    }

    pub fn status(&self, value: f64) -> BandStatus {
        if self.lower_is_worse() {
            if value <= self.critical {
                BandStatus::Critical
            } else if value <= self.warning {
                BandStatus::Warning
            } else {
                BandStatus::Ok
            }
        } else if value >= self.critical {
            BandStatus::Critical
        } else if value >= self.warning {
            BandStatus::Warning
        } else {
            BandStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Console,
    Webhook,
    Email,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub kind: ChannelKind,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
}

impl ChannelSettings {
    pub fn new(kind: ChannelKind, enabled: bool) -> Self {
        Self {
            kind,
            enabled,
            url: None,
            smtp_host: None,
            smtp_port: None,
            username: None,
            password: None,
            from: None,
            to: Vec::new(),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self.kind {
            ChannelKind::Console => Ok(()),
            ChannelKind::Webhook => {
                let url = self.url.as_deref().ok_or("webhook requires `url`")?;
                url::Url::parse(url).map_err(|err| format!("invalid url: {err}"))?;
                Ok(())
            }
            ChannelKind::Email => {
                if self.smtp_host.as_deref().map_or(true, str::is_empty) {
                    return Err("email requires `smtp_host`".into());
                }
                if self.from.as_deref().map_or(true, str::is_empty) {
                    return Err("email requires `from`".into());
                }
                if self.to.is_empty() {
                    return Err("email requires at least one recipient in `to`".into());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    Command,
    ReportFile,
    Http,
}

/// `Quick` producers run on every pass; `Full` ones only on full passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerDepth {
    #[default]
    Quick,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerSettings {
    pub name: String,
    pub kind: ProducerKind,
    #[serde(default)]
    pub depth: ProducerDepth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ProducerSettings {
    pub fn new(name: impl Into<String>, kind: ProducerKind, depth: ProducerDepth) -> Self {
        Self {
            name: name.into(),
            kind,
            depth,
            command: None,
            args: Vec::new(),
            path: None,
            url: None,
            target_latency_ms: None,
            timeout_seconds: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(30))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.timeout_seconds == Some(0) {
            return Err("timeout_seconds must be greater than zero".into());
        }
        match self.kind {
            ProducerKind::Command => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err("command producer requires `command`".into());
                }
            }
            ProducerKind::ReportFile => {
                if self.path.as_deref().map_or(true, str::is_empty) {
                    return Err("report_file producer requires `path`".into());
                }
            }
            ProducerKind::Http => {
                let url = self.url.as_deref().ok_or("http producer requires `url`")?;
                url::Url::parse(url).map_err(|err| format!("invalid url: {err}"))?;
                if let Some(target) = self.target_latency_ms {
                    if !target.is_finite() || target <= 0.0 {
                        return Err("target_latency_ms must be positive".into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Strict load: the file must exist, parse and validate.
pub fn load_monitoring_config<P: AsRef<Path>>(path: P) -> Result<MonitoringConfig> {
    let path = path.as_ref();
    let config: MonitoringConfig = load_toml(path)?;
    config.validate().map_err(|reason| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(config)
}

/// Loads the configuration, synthesising and persisting defaults when the
/// file does not exist. Failing to persist the defaults is not fatal.
pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<MonitoringConfig> {
    let path = path.as_ref();
    if path.exists() {
        return load_monitoring_config(path);
    }

    let config = MonitoringConfig::default();
    match config.save(path) {
        Ok(()) => info!(
            target: "config",
            path = %path.display(),
            "wrote default monitoring configuration"
        ),
        Err(err) => warn!(
            target: "config",
            path = %path.display(),
            error = %err,
            "could not persist default configuration; continuing with defaults"
        ),
    }
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
retention_days = 14
trend_window = 5

[paths]
data_dir = "/var/lib/qmon"
history_file = "history.json"
alert_log_file = "alerts.json"
reports_dir = "reports"

[intervals]
quick_seconds = 60
full_seconds = 600

[thresholds."uat.successRate"]
warning = 0.8
critical = 0.6

[channels.console]
kind = "console"
enabled = true

[[alert_rules]]
name = "uat-low"
metric_path = "uat.successRate"
condition = "below"
threshold = 0.75
severity = "warning"

[[producers]]
name = "uat"
kind = "report_file"
depth = "full"
path = "uat.json"
"#;

    #[test]
    fn parses_fixture() {
        let config: MonitoringConfig = toml::from_str(FIXTURE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.alert_log_retention_days, 7);
        assert_eq!(config.alert_rules[0].condition, Condition::Below);
        assert_eq!(config.producers[0].depth, ProducerDepth::Full);
        assert_eq!(
            config.history_path(),
            PathBuf::from("/var/lib/qmon/history.json")
        );
        assert_eq!(config.intervals.quick(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_condition_is_a_parse_error() {
        let broken = FIXTURE.replace("condition = \"below\"", "condition = \"between\"");
        assert!(toml::from_str::<MonitoringConfig>(&broken).is_err());
    }

    #[test]
    fn duplicate_rules_fail_validation() {
        let mut config = MonitoringConfig::default();
        let rule = config.alert_rules[0].clone();
        config.alert_rules.push(rule);
        assert!(config.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn enabled_webhook_needs_url() {
        let mut config = MonitoringConfig::default();
        config
            .channels
            .get_mut("webhook")
            .unwrap()
            .enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_are_valid_and_round_trip() {
        let config = MonitoringConfig::default();
        config.validate().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: MonitoringConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/monitoring.toml");
        let config = load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, MonitoringConfig::default());
        let reloaded = load_or_create(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn band_direction_is_inferred() {
        let success = ThresholdBand::new(0.75, 0.5);
        assert_eq!(success.status(0.9), BandStatus::Ok);
        assert_eq!(success.status(0.7), BandStatus::Warning);
        assert_eq!(success.status(0.4), BandStatus::Critical);

        let memory = ThresholdBand::new(512.0, 1024.0);
        assert_eq!(memory.status(100.0), BandStatus::Ok);
        assert_eq!(memory.status(600.0), BandStatus::Warning);
        assert_eq!(memory.status(2048.0), BandStatus::Critical);
    }
}

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use qmon_core::{
    load_or_create, ConfigError, HealthReport, Mode, MonitoringContext, Scheduler, SchedulerError,
    TrendsReport,
};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("monitoring error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Quality-metrics monitoring and alerting", long_about = None)]
pub struct Cli {
    /// Path to monitoring.toml (created with defaults when missing)
    #[arg(long, default_value = "config/monitoring.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    /// What to run
    #[arg(value_enum, default_value_t = ModeArg::Quick)]
    pub mode: ModeArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// One pass over the quick producers
    Quick,
    /// One pass over every producer, with the combined report
    Full,
    /// Quick and full timers until Ctrl-C
    Continuous,
    /// Collaborator reachability only
    HealthCheck,
    /// Trend report over the retained history
    Trends,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Quick => Mode::Quick,
            ModeArg::Full => Mode::Full,
            ModeArg::Continuous => Mode::Continuous,
            ModeArg::HealthCheck => Mode::HealthCheck,
            ModeArg::Trends => Mode::Trends,
        }
    }
}

pub fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    run_until(cli, shutdown_signal()).await
}

/// Like [`run`], with an explicit stop signal for continuous mode.
pub async fn run_until<F>(cli: Cli, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let config = load_or_create(&cli.config)?;
    let scheduler = Arc::new(Scheduler::from_config(config));

    match Mode::from(cli.mode) {
        Mode::Quick => {
            let context = scheduler.run_quick().await?;
            render(&context, cli.format)?;
        }
        Mode::Full => {
            let context = scheduler.run_full().await?;
            render(&context, cli.format)?;
        }
        Mode::Continuous => {
            scheduler.run_continuous(shutdown).await?;
        }
        Mode::HealthCheck => {
            let report = scheduler.run_health_check().await;
            render(&report, cli.format)?;
        }
        Mode::Trends => {
            let report = scheduler.run_trends();
            render(&report, cli.format)?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(target: "scheduler", error = %err, "cannot listen for Ctrl-C, stopping");
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for MonitoringContext {
    fn display(&self) -> String {
        let metrics = self
            .reading
            .as_ref()
            .map(|reading| reading.metrics.len() + reading.system_stats.len())
            .unwrap_or(0);
        let mut lines = vec![format!(
            "{tag} cycle: {metrics} values, {alerts} alerts, {failures} collection failures, {history} readings retained",
            tag = self.tag,
            alerts = self.alerts.len(),
            failures = self.collection_failures.len(),
            history = self.history_len,
        )];

        if let Some(reading) = &self.reading {
            for path in reading.paths() {
                let value = reading.value(&path).unwrap_or_default();
                match self.threshold_status.get(&path) {
                    Some(status) => lines.push(format!("  {path} = {value:.2} [{status:?}]")),
                    None => lines.push(format!("  {path} = {value:.2}")),
                }
            }
        }
        if !self.alerts.is_empty() {
            lines.push("Alerts:".to_string());
            for alert in &self.alerts {
                lines.push(format!(
                    "  [{}] {}: {}",
                    alert.severity, alert.rule_name, alert.message
                ));
            }
        }
        if !self.trends.metrics.is_empty() {
            lines.push("Trends:".to_string());
            for (key, trend) in &self.trends.metrics {
                lines.push(format!("  {key}: {trend}"));
            }
            if let Some(memory) = self.trends.memory {
                lines.push(format!("  memory: {memory}"));
            }
        }
        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            lines.extend(self.warnings.iter().map(|w| format!("  {w}")));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for HealthReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "overall: {}",
            if self.healthy { "healthy" } else { "unhealthy" }
        )];
        for check in &self.checks {
            lines.push(format!(
                "[{status}] {name}: {reason}",
                status = if check.healthy { "OK" } else { "FAIL" },
                name = check.name,
                reason = check.reason
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TrendsReport {
    fn display(&self) -> String {
        if self.window == 0 {
            return "no readings in history".to_string();
        }
        let mut lines = vec![format!("trends over the last {} readings", self.window)];
        for (key, trend) in &self.trends.metrics {
            lines.push(format!("  {key}: {trend}"));
        }
        if let Some(memory) = self.trends.memory {
            lines.push(format!("  memory: {memory}"));
        }
        if !self.threshold_status.is_empty() {
            lines.push("Latest status:".to_string());
            for (path, status) in &self.threshold_status {
                lines.push(format!("  {path}: {status:?}"));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmon_core::MonitoringConfig;
    use std::path::Path;
    use std::time::Duration;

    fn write_config(dir: &Path) -> PathBuf {
        let mut config = MonitoringConfig::default();
        config.paths.data_dir = dir.join("data").display().to_string();
        config.producers.clear();
        config.health.framework_url = None;
        config.health.expected_files.clear();
        let path = dir.join("monitoring.toml");
        config.save(&path).unwrap();
        path
    }

    fn cli(config: PathBuf, mode: ModeArg) -> Cli {
        Cli {
            config,
            format: OutputFormat::Json,
            verbose: false,
            mode,
        }
    }

    #[test]
    fn mode_defaults_to_quick() {
        let cli = Cli::try_parse_from(["qmonctl"]).unwrap();
        assert_eq!(cli.mode, ModeArg::Quick);
        let cli = Cli::try_parse_from(["qmonctl", "health-check"]).unwrap();
        assert_eq!(cli.mode, ModeArg::HealthCheck);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["qmonctl", "weekly"]).is_err());
    }

    #[tokio::test]
    async fn quick_mode_persists_history_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        run_until(cli(config, ModeArg::Quick), async {}).await.unwrap();
        assert!(dir.path().join("data/history.json").exists());
        assert!(dir.path().join("data/reports/latest-quick.json").exists());
    }

    #[tokio::test]
    async fn malformed_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitoring.toml");
        std::fs::write(&path, "[[alert_rules]]\nname = \"x\"\ncondition = \"sideways\"\n").unwrap();
        let result = run_until(cli(path, ModeArg::Quick), async {}).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn continuous_mode_returns_after_stop_signal() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        run_until(
            cli(config, ModeArg::Continuous),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(dir.path().join("data/history.json").exists());
    }
}

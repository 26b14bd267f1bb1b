use std::collections::BTreeMap;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{MonitoringConfig, ProducerDepth, ProducerKind, ProducerSettings};
use crate::model::Reading;

/// Flat key → value result of one producer call. Keys are relative to the
/// producer; the collector prefixes them with the producer name.
pub type Sample = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid sample output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("producer returned no numeric values")]
    Empty,
    #[error("producer panicked: {0}")]
    Panicked(String),
}

#[async_trait]
pub trait SampleProducer: Send + Sync {
    fn name(&self) -> &str;

    fn depth(&self) -> ProducerDepth {
        ProducerDepth::Quick
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn sample(&self) -> Result<Sample, CollectError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionFailure {
    pub producer: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionOutcome {
    pub reading: Reading,
    pub failures: Vec<CollectionFailure>,
}

pub struct MetricsCollector {
    producers: Vec<Box<dyn SampleProducer>>,
    started: Instant,
    system_stats: bool,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.producers.iter().map(|p| p.name()).collect();
        f.debug_struct("MetricsCollector")
            .field("producers", &names)
            .field("system_stats", &self.system_stats)
            .finish()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            producers: Vec::new(),
            started: Instant::now(),
            system_stats: true,
        }
    }

    pub fn from_config(config: &MonitoringConfig) -> Self {
        config
            .producers
            .iter()
            .fold(Self::new(), |collector, settings| {
                collector.with_producer(producer_from_settings(config, settings))
            })
    }

    pub fn with_producer(mut self, producer: Box<dyn SampleProducer>) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn without_system_stats(mut self) -> Self {
        self.system_stats = false;
        self
    }

    /// Samples every producer of the requested depth. A failing or stalled
    /// producer leaves its metrics absent and never aborts the pass.
    pub async fn collect(&self, depth: ProducerDepth) -> CollectionOutcome {
        let mut reading = Reading::new(Utc::now());
        let selected: Vec<&dyn SampleProducer> = self
            .producers
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| depth == ProducerDepth::Full || p.depth() == ProducerDepth::Quick)
            .collect();

        let results = join_all(selected.iter().copied().map(|producer| async move {
            let limit = producer.timeout();
            let sampling = AssertUnwindSafe(producer.sample()).catch_unwind();
            let result = match timeout(limit, sampling).await {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => Err(CollectError::Panicked(panic_message(payload.as_ref()))),
                Err(_) => Err(CollectError::Timeout(limit)),
            };
            (producer.name(), result)
        }))
        .await;

        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(sample) => {
                    debug!(target: "collector", producer = name, values = sample.len(), "sample collected");
                    for (key, value) in sample {
                        if value.is_finite() {
                            reading.metrics.insert(format!("{name}.{key}"), value);
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "collector", producer = name, error = %err, "sample producer failed");
                    failures.push(CollectionFailure {
                        producer: name.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if self.system_stats {
            reading.system_stats = self.system_snapshot();
        }
        CollectionOutcome { reading, failures }
    }

    fn system_snapshot(&self) -> BTreeMap<String, f64> {
        let mut stats = BTreeMap::new();
        let mut uptime = self.started.elapsed().as_secs_f64();

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total > 0 {
            stats.insert(
                "systemMemoryUsedPct".to_string(),
                system.used_memory() as f64 / total as f64 * 100.0,
            );
        }
        if let Ok(pid) = sysinfo::get_current_pid() {
            if system.refresh_process(pid) {
                if let Some(process) = system.process(pid) {
                    stats.insert(
                        "memoryMb".to_string(),
                        process.memory() as f64 / (1024.0 * 1024.0),
                    );
                    uptime = uptime.max(process.run_time() as f64);
                }
            }
        }
        stats.insert("uptimeSeconds".to_string(), uptime);
        stats
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn producer_from_settings(
    config: &MonitoringConfig,
    settings: &ProducerSettings,
) -> Box<dyn SampleProducer> {
    match settings.kind {
        ProducerKind::Command => Box::new(CommandProducer {
            name: settings.name.clone(),
            depth: settings.depth,
            timeout: settings.timeout(),
            command: settings.command.clone().unwrap_or_default(),
            args: settings.args.clone(),
            working_dir: None,
        }),
        ProducerKind::ReportFile => Box::new(ReportFileProducer {
            name: settings.name.clone(),
            depth: settings.depth,
            timeout: settings.timeout(),
            path: config.resolve_path(settings.path.clone().unwrap_or_default()),
        }),
        ProducerKind::Http => Box::new(HttpProbeProducer::new(
            settings.name.clone(),
            settings.url.clone().unwrap_or_default(),
            settings.depth,
            settings.timeout(),
            settings.target_latency_ms.unwrap_or(200.0),
        )),
    }
}

/// Runs an external test runner whose stdout is a JSON report.
#[derive(Debug, Clone)]
pub struct CommandProducer {
    pub name: String,
    pub depth: ProducerDepth,
    pub timeout: Duration,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[async_trait]
impl SampleProducer for CommandProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn depth(&self) -> ProducerDepth {
        self.depth
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn sample(&self) -> Result<Sample, CollectError> {
        let mut command = Command::new(&self.command);
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let output = command.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Test runners exit non-zero when tests fail but still print a report.
        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(value) => sample_from_report(&value),
            Err(_) if !output.status.success() => Err(CollectError::CommandFailure {
                command: self.command.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Err(err) => Err(CollectError::Parse(err)),
        }
    }
}

/// Reads a JSON report left behind by an external runner.
#[derive(Debug, Clone)]
pub struct ReportFileProducer {
    pub name: String,
    pub depth: ProducerDepth,
    pub timeout: Duration,
    pub path: PathBuf,
}

#[async_trait]
impl SampleProducer for ReportFileProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn depth(&self) -> ProducerDepth {
        self.depth
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn sample(&self) -> Result<Sample, CollectError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let value: Value = serde_json::from_str(&content)?;
        sample_from_report(&value)
    }
}

/// Timed GET that turns response latency into a synthetic score.
#[derive(Debug, Clone)]
pub struct HttpProbeProducer {
    name: String,
    url: String,
    depth: ProducerDepth,
    timeout: Duration,
    target_latency_ms: f64,
    client: reqwest::Client,
}

impl HttpProbeProducer {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        depth: ProducerDepth,
        timeout: Duration,
        target_latency_ms: f64,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            depth,
            timeout,
            target_latency_ms,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SampleProducer for HttpProbeProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn depth(&self) -> ProducerDepth {
        self.depth
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn sample(&self) -> Result<Sample, CollectError> {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let available = response.status().is_success();

        let mut sample = Sample::new();
        sample.insert("latencyMs".into(), latency_ms);
        sample.insert("available".into(), if available { 1.0 } else { 0.0 });
        let score = if available {
            latency_score(latency_ms, self.target_latency_ms)
        } else {
            0.0
        };
        sample.insert("score".into(), score);
        Ok(sample)
    }
}

/// 100 at or under the target latency, decaying proportionally above it.
pub fn latency_score(latency_ms: f64, target_ms: f64) -> f64 {
    if latency_ms <= 0.0 {
        return 100.0;
    }
    (100.0 * target_ms / latency_ms).clamp(0.0, 100.0)
}

/// Flattens a JSON report into dotted numeric keys and derives `successRate`
/// from pass/fail counters when the report does not carry one.
pub fn sample_from_report(value: &Value) -> Result<Sample, CollectError> {
    let mut sample = Sample::new();
    flatten_json(value, "", &mut sample);

    if !sample.contains_key("successRate") {
        if let Some(passed) = sample.get("passed").copied() {
            let total = sample
                .get("total")
                .copied()
                .or_else(|| sample.get("failed").map(|failed| passed + failed));
            if let Some(total) = total.filter(|total| *total > 0.0) {
                sample.insert("successRate".into(), passed / total);
            }
        }
    }

    if sample.is_empty() {
        return Err(CollectError::Empty);
    }
    Ok(sample)
}

fn flatten_json(value: &Value, prefix: &str, out: &mut Sample) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_json(child, &path, out);
            }
        }
        Value::Number(number) if !prefix.is_empty() => {
            if let Some(v) = number.as_f64() {
                out.insert(prefix.to_string(), v);
            }
        }
        Value::Bool(flag) if !prefix.is_empty() => {
            out.insert(prefix.to_string(), if *flag { 1.0 } else { 0.0 });
        }
        _ => {}
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::collector::{CollectionOutcome, MetricsCollector};
use crate::config::{BandStatus, MonitoringConfig, ProducerDepth};
use crate::context::{threshold_status, MonitoringContext};
use crate::dispatcher::AlertDispatcher;
use crate::health::{HealthChecker, HealthReport};
use crate::history::{HistoryError, HistoryStore};
use crate::rules::RuleEngine;
use crate::snapshot::{SnapshotError, SnapshotWriter};
use crate::trend::{TrendAnalyzer, TrendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Quick,
    Full,
    Continuous,
    HealthCheck,
    Trends,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Full => "full",
            Mode::Continuous => "continuous",
            Mode::HealthCheck => "health-check",
            Mode::Trends => "trends",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = SchedulerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "quick" => Ok(Mode::Quick),
            "full" => Ok(Mode::Full),
            "continuous" => Ok(Mode::Continuous),
            "health-check" => Ok(Mode::HealthCheck),
            "trends" => Ok(Mode::Trends),
            other => Err(SchedulerError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown mode `{0}`")]
    UnknownMode(String),
    #[error("persistence failed: history: {history}; snapshot: {snapshot}")]
    Persistence {
        history: HistoryError,
        snapshot: SnapshotError,
    },
    #[error("cycle task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Output of the `trends` mode.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendsReport {
    pub generated_at: DateTime<Utc>,
    pub window: usize,
    pub latest: Option<DateTime<Utc>>,
    pub trends: TrendResult,
    pub threshold_status: BTreeMap<String, BandStatus>,
}

/// Drives collector → history → trends → rules → dispatcher for one cycle,
/// and the two recurring timers of continuous mode.
#[derive(Debug)]
pub struct Scheduler {
    config: Arc<MonitoringConfig>,
    collector: MetricsCollector,
    history: HistoryStore,
    analyzer: TrendAnalyzer,
    engine: RuleEngine,
    dispatcher: AlertDispatcher,
    snapshots: SnapshotWriter,
    health: HealthChecker,
}

impl Scheduler {
    /// Wires every component from configuration. The persisted history is
    /// loaded here; an unreadable file starts an empty series.
    pub fn from_config(config: MonitoringConfig) -> Self {
        let collector = MetricsCollector::from_config(&config);
        let history = HistoryStore::open(config.history_path());
        let dispatcher = AlertDispatcher::from_config(&config);
        Self::new(config, collector, history, dispatcher)
    }

    pub fn new(
        config: MonitoringConfig,
        collector: MetricsCollector,
        history: HistoryStore,
        dispatcher: AlertDispatcher,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            analyzer: TrendAnalyzer::new(config.tracked_metrics()),
            engine: RuleEngine::new(config.alert_rules.clone()),
            snapshots: SnapshotWriter::from_config(&config),
            health: HealthChecker::new(Arc::clone(&config)),
            config,
            collector,
            history,
            dispatcher,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn snapshots(&self) -> &SnapshotWriter {
        &self.snapshots
    }

    pub async fn run_quick(&self) -> Result<MonitoringContext, SchedulerError> {
        self.run_cycle(ProducerDepth::Quick).await
    }

    pub async fn run_full(&self) -> Result<MonitoringContext, SchedulerError> {
        self.run_cycle(ProducerDepth::Full).await
    }

    /// One monitoring pass. Only a simultaneous failure to persist both the
    /// history and the snapshot is an error; everything else degrades to a
    /// logged warning recorded in the returned context.
    pub async fn run_cycle(&self, depth: ProducerDepth) -> Result<MonitoringContext, SchedulerError> {
        let tag = match depth {
            ProducerDepth::Quick => "quick",
            ProducerDepth::Full => "full",
        };
        tracing::info!(target: "scheduler", mode = tag, "monitoring cycle started");

        let CollectionOutcome { reading, failures } = self.collector.collect(depth).await;
        let mut context = MonitoringContext::new(tag);
        for failure in &failures {
            context.warn(format!("producer {} failed: {}", failure.producer, failure.reason));
        }

        let (stored, pruned) =
            self.history
                .append_and_prune(reading, self.config.retention_days, Utc::now());
        let history_error = self.history.save().err();
        if let Some(err) = &history_error {
            tracing::warn!(target: "history", error = %err, "failed to persist history");
            context.warn(format!("history not persisted: {err}"));
        }
        context = context
            .with_failures(failures)
            .with_stored(stored.clone(), pruned, self.history.len());

        let window = self.history.window(self.config.trend_window);
        let trends = self.analyzer.analyze(&window);
        let alerts = self.engine.evaluate(&stored);
        let dispatch = self.dispatcher.dispatch(&alerts).await;
        for failure in dispatch.failures() {
            context.warn(format!(
                "alert {} not delivered to {}",
                failure.rule_name, failure.channel
            ));
        }
        context = context
            .with_trends(trends)
            .with_alerts(alerts)
            .with_dispatch(dispatch)
            .with_threshold_status(threshold_status(&self.config, &stored));

        let now = Utc::now();
        let snapshot_error = self.snapshots.write(tag, &context, now).err();
        if let Some(err) = &snapshot_error {
            tracing::warn!(target: "snapshot", mode = tag, error = %err, "failed to write snapshot");
        }
        if let Err(err) = self.snapshots.prune(now) {
            tracing::warn!(target: "snapshot", error = %err, "failed to prune snapshots");
        }

        if let (Some(history), Some(snapshot)) = (history_error, snapshot_error) {
            return Err(SchedulerError::Persistence { history, snapshot });
        }

        tracing::info!(
            target: "scheduler",
            mode = tag,
            alerts = context.alerts.len(),
            failures = context.collection_failures.len(),
            history = context.history_len,
            "monitoring cycle completed"
        );
        Ok(context)
    }

    /// Named collaborator checks. Never collects metrics, never appends to
    /// history and never evaluates rules.
    pub async fn run_health_check(&self) -> HealthReport {
        let report = self.health.run().await;
        if let Err(err) = self.snapshots.write("health", &report, report.checked_at) {
            tracing::warn!(target: "snapshot", mode = "health", error = %err, "failed to write snapshot");
        }
        report
    }

    /// Trend classification over the retained history, without collecting.
    pub fn run_trends(&self) -> TrendsReport {
        let window = self.history.window(self.config.trend_window);
        let latest = window.last();
        let report = TrendsReport {
            generated_at: Utc::now(),
            window: window.len(),
            latest: latest.map(|reading| reading.timestamp),
            trends: self.analyzer.analyze(&window),
            threshold_status: latest
                .map(|reading| threshold_status(&self.config, reading))
                .unwrap_or_default(),
        };
        if let Err(err) = self.snapshots.write("trends", &report, report.generated_at) {
            tracing::warn!(target: "snapshot", mode = "trends", error = %err, "failed to write snapshot");
        }
        report
    }

    /// Arms the quick and full timers. Both tick immediately, then every
    /// configured interval, until [`ContinuousRun::stop`] is called.
    pub fn start_continuous(self: &Arc<Self>) -> ContinuousRun {
        self.start_continuous_with(self.config.intervals.quick(), self.config.intervals.full())
    }

    pub fn start_continuous_with(self: &Arc<Self>, quick: Duration, full: Duration) -> ContinuousRun {
        let (stop_tx, stop_rx) = watch::channel(false);
        tracing::info!(
            target: "scheduler",
            quick_seconds = quick.as_secs(),
            full_seconds = full.as_secs(),
            "continuous monitoring started"
        );
        let tasks = vec![
            tokio::spawn(timer_loop(Arc::clone(self), ProducerDepth::Quick, quick, stop_rx.clone())),
            tokio::spawn(timer_loop(Arc::clone(self), ProducerDepth::Full, full, stop_rx)),
        ];
        ContinuousRun {
            stop: stop_tx,
            tasks,
        }
    }

    /// Runs continuous mode until `shutdown` resolves, then stops both
    /// timers and waits for any in-flight cycle.
    pub async fn run_continuous<F>(self: Arc<Self>, shutdown: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send,
    {
        let run = self.start_continuous();
        shutdown.await;
        tracing::info!(target: "scheduler", "stop requested");
        run.stop().await
    }
}

/// Handle on the two armed timers of continuous mode.
#[derive(Debug)]
pub struct ContinuousRun {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<u64>>,
}

impl ContinuousRun {
    /// Disarms both timers. A cycle already running completes first.
    pub async fn stop(self) -> Result<(), SchedulerError> {
        let _ = self.stop.send(true);
        let mut cycles = 0;
        for task in self.tasks {
            cycles += task.await?;
        }
        tracing::info!(target: "scheduler", cycles, "continuous monitoring stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

async fn timer_loop(
    scheduler: Arc<Scheduler>,
    depth: ProducerDepth,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0;

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // Spawned so a panicking cycle is contained like any other
                // cycle failure; awaited so stop never cuts a cycle short.
                let cycle = tokio::spawn({
                    let scheduler = Arc::clone(&scheduler);
                    async move { scheduler.run_cycle(depth).await }
                });
                cycles += 1;
                match cycle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        tracing::error!(target: "scheduler", ?depth, error = %err, "monitoring cycle failed")
                    }
                    Err(err) => {
                        tracing::error!(target: "scheduler", ?depth, error = %err, "monitoring cycle aborted")
                    }
                }
            }
        }
    }
    cycles
}

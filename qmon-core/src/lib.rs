pub mod collector;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod history;
pub mod model;
pub mod notify;
pub mod rules;
pub mod scheduler;
pub mod snapshot;
pub mod trend;

pub use collector::{
    CollectError, CollectionFailure, CollectionOutcome, CommandProducer, HttpProbeProducer,
    MetricsCollector, ReportFileProducer, Sample, SampleProducer,
};
pub use config::{
    load_monitoring_config, load_or_create, BandStatus, ChannelKind, ChannelSettings,
    MonitoringConfig, ProducerDepth, ProducerKind, ProducerSettings, ThresholdBand,
};
pub use context::MonitoringContext;
pub use dispatcher::{
    AlertDispatcher, AlertLog, AlertLogEntry, AlertLogError, ChannelDelivery, DispatchReport,
};
pub use error::{ConfigError, Result};
pub use health::{CheckResult, HealthChecker, HealthReport};
pub use history::{HistoryError, HistoryStore};
pub use model::{Alert, Condition, Reading, Rule, Severity};
pub use notify::{ChannelError, ConsoleChannel, EmailChannel, NotificationChannel, WebhookChannel};
pub use rules::RuleEngine;
pub use scheduler::{ContinuousRun, Mode, Scheduler, SchedulerError, TrendsReport};
pub use snapshot::{SnapshotError, SnapshotWriter};
pub use trend::{MemoryTrend, Trend, TrendAnalyzer, TrendResult};

pub mod alert;
pub mod clock;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod matcher;
pub mod monitor;
pub mod notifier;
pub mod query;
pub mod registry;
pub mod rule;
pub mod sample;
pub mod snapshot;
pub mod store;

pub use alert::{
    Alert, AlertCounts, AlertEvent, AlertEventKind, AlertId, AlertKey, AlertState, ResolveReason,
    Transition, Trigger,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, EvaluationError, IngestError, QueryError};
pub use evaluator::{EvaluatorConfig, EvaluatorHealth, RuleEvaluator, TickReport};
pub use ingest::{IngestConfig, IngestReport, IngestStats, SampleIngestor};
pub use matcher::{Pattern, SeriesMatcher};
pub use monitor::{MaintenanceReport, Monitor, MonitorConfig};
pub use notifier::{
    LogNotifier, NotificationManager, Notifier, NotifierConfig, NotifierError, WebhookNotifier,
};
pub use query::Aggregation;
pub use registry::{AlertRegistry, RegistryConfig};
pub use rule::{compile_rules, Comparator, Condition, ConditionKind, Rule, RuleDefinition, Severity};
pub use sample::{Sample, SamplePoint, SeriesKey};
pub use snapshot::{ConsistencyGate, MetricSummary, Snapshot, SnapshotPublisher};
pub use store::{AppendOutcome, CapacityClass, SeriesConfig, SeriesStore, SeriesSummary, StoreStats};

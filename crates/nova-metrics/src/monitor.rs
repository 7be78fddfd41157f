use crate::alert::AlertEvent;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, IngestError};
use crate::evaluator::{EvaluatorConfig, RuleEvaluator};
use crate::ingest::{IngestConfig, IngestReport, SampleIngestor};
use crate::registry::{AlertRegistry, RegistryConfig};
use crate::rule::Rule;
use crate::sample::Sample;
use crate::snapshot::{ConsistencyGate, Snapshot, SnapshotPublisher};
use crate::store::{AppendOutcome, SeriesConfig, SeriesStore};
use nova_shutdown::ShutdownListener;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// 监控核心配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub ingest: IngestConfig,
    pub series: SeriesConfig,
    pub evaluator: EvaluatorConfig,
    pub alerts: RegistryConfig,
}

/// 一次维护的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub series_evicted: usize,
    pub history_pruned: usize,
    pub orphans_resolved: usize,
}

/// 监控核心
///
/// 把序列存储、写入器、告警注册表、评估器和快照发布器组装在一起。
pub struct Monitor {
    store: Arc<SeriesStore>,
    ingestor: Arc<SampleIngestor>,
    registry: Arc<AlertRegistry>,
    evaluator: Arc<RuleEvaluator>,
    publisher: SnapshotPublisher,
    clock: Arc<dyn Clock>,
    gate: ConsistencyGate,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        rules: Vec<Rule>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if config.alerts.history_capacity == 0 {
            return Err(ConfigError::invalid("alerts.history_capacity must be greater than 0"));
        }

        let gate = ConsistencyGate::default();
        let store = Arc::new(SeriesStore::new(config.series.clone(), clock.clone())?);
        let ingestor = Arc::new(SampleIngestor::new(&config.ingest, store.clone(), clock.clone()));
        let registry = Arc::new(AlertRegistry::new(config.alerts.clone()));
        let evaluator = Arc::new(
            RuleEvaluator::new(
                config.evaluator.clone(),
                rules,
                store.clone(),
                registry.clone(),
                clock.clone(),
            )?
            .with_gate(gate.clone()),
        );
        let publisher = SnapshotPublisher::new(
            store.clone(),
            registry.clone(),
            ingestor.clone(),
            evaluator.clone(),
            clock.clone(),
            gate.clone(),
        );

        info!(
            rules = evaluator.rules().len(),
            period = ?config.evaluator.period,
            default_capacity = config.series.default_capacity,
            "Monitor initialized"
        );

        Ok(Self {
            store,
            ingestor,
            registry,
            evaluator,
            publisher,
            clock,
            gate,
            config,
        })
    }

    pub fn with_system_clock(config: MonitorConfig, rules: Vec<Rule>) -> Result<Self, ConfigError> {
        Self::new(config, rules, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.store
    }

    pub fn ingestor(&self) -> &Arc<SampleIngestor> {
        &self.ingestor
    }

    pub fn registry(&self) -> &Arc<AlertRegistry> {
        &self.registry
    }

    pub fn evaluator(&self) -> &Arc<RuleEvaluator> {
        &self.evaluator
    }

    pub fn ingest(&self, sample: Sample) -> Result<AppendOutcome, IngestError> {
        self.ingestor.ingest(sample)
    }

    pub fn ingest_batch(&self, samples: Vec<Sample>) -> IngestReport {
        self.ingestor.ingest_batch(samples)
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.publisher.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.registry.subscribe()
    }

    /// 淘汰过期序列、清理告警历史、解除已移除规则的告警
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let orphans_resolved = self
            .registry
            .resolve_orphans(&self.evaluator.rule_ids(), now)
            .await;

        let series_evicted = {
            let _gate = self.gate.write().await;
            let protected = self.registry.active_series().await;
            self.store.evict_stale(now, |key| protected.contains(key))
        };

        let history_pruned = self.registry.prune(now).await;

        let report = MaintenanceReport {
            series_evicted,
            history_pruned,
            orphans_resolved,
        };
        debug!(?report, "Maintenance completed");
        report
    }

    /// 周期性维护，直到收到关闭信号
    pub async fn run_maintenance_loop(&self, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.config.evaluator.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            self.run_maintenance().await;
        }

        info!("Maintenance loop stopped");
    }
}

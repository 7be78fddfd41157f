use crate::alert::{Alert, AlertCounts};
use crate::clock::Clock;
use crate::evaluator::{EvaluatorHealth, RuleEvaluator};
use crate::ingest::{IngestStats, SampleIngestor};
use crate::registry::AlertRegistry;
use crate::store::{SeriesStore, SeriesSummary, StoreStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 快照与序列淘汰之间的闸门
///
/// 快照和规则评估持有读锁，淘汰持有写锁：快照期间不会有序列消失。
pub type ConsistencyGate = Arc<RwLock<()>>;

/// 单个序列在 `/api/metrics` 中的形态
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub latest: f64,
    pub mean: f64,
    pub count: usize,
}

/// 某一时刻的只读状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub series: Vec<SeriesSummary>,
    pub active_alerts: Vec<Alert>,
    pub alert_counts: AlertCounts,
    pub evaluator: EvaluatorHealth,
    pub ingest: IngestStats,
    pub store: StoreStats,
}

impl Snapshot {
    pub fn metrics_map(&self) -> BTreeMap<String, MetricSummary> {
        self.series
            .iter()
            .map(|summary| {
                (
                    summary.identity.clone(),
                    MetricSummary {
                        latest: summary.latest,
                        mean: summary.mean,
                        count: summary.count,
                    },
                )
            })
            .collect()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn monitors_count(&self) -> usize {
        self.evaluator.active_rules
    }

    pub fn summary(&self, identity: &str) -> Option<&SeriesSummary> {
        self.series.iter().find(|summary| summary.identity == identity)
    }
}

/// 快照发布器
pub struct SnapshotPublisher {
    store: Arc<SeriesStore>,
    registry: Arc<AlertRegistry>,
    ingestor: Arc<SampleIngestor>,
    evaluator: Arc<RuleEvaluator>,
    clock: Arc<dyn Clock>,
    gate: ConsistencyGate,
}

impl SnapshotPublisher {
    pub fn new(
        store: Arc<SeriesStore>,
        registry: Arc<AlertRegistry>,
        ingestor: Arc<SampleIngestor>,
        evaluator: Arc<RuleEvaluator>,
        clock: Arc<dyn Clock>,
        gate: ConsistencyGate,
    ) -> Self {
        Self {
            store,
            registry,
            ingestor,
            evaluator,
            clock,
            gate,
        }
    }

    /// 深拷贝当前状态，返回后不再受后续写入影响
    pub async fn snapshot(&self) -> Snapshot {
        let _gate = self.gate.read().await;
        let taken_at = self.clock.now();

        // 先取告警再取序列：告警引用的序列此后只会多不会少
        let (active_alerts, alert_counts) = self.registry.overview().await;
        let series = self.store.summaries();

        Snapshot {
            taken_at,
            series,
            active_alerts,
            alert_counts,
            evaluator: self.evaluator.health(),
            ingest: self.ingestor.stats(),
            store: self.store.stats(),
        }
    }
}

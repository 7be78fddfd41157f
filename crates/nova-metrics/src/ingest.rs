use crate::clock::{to_chrono, Clock};
use crate::error::IngestError;
use crate::sample::Sample;
use crate::store::{AppendOutcome, SeriesStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 写入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    #[serde(with = "humantime_serde")]
    pub max_future_skew: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::from_secs(5 * 60),
        }
    }
}

/// 写入统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected_invalid_value: u64,
    pub rejected_clock_skew: u64,
    pub rejected_empty_name: u64,
}

impl IngestStats {
    pub fn rejected(&self) -> u64 {
        self.rejected_invalid_value + self.rejected_clock_skew + self.rejected_empty_name
    }
}

/// 批量写入结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    /// 被乱序策略丢弃的样本，计入 accepted
    pub dropped_out_of_order: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct IngestCounters {
    accepted: AtomicU64,
    rejected_invalid_value: AtomicU64,
    rejected_clock_skew: AtomicU64,
    rejected_empty_name: AtomicU64,
}

/// 样本写入器
///
/// 校验、规范化样本后写入序列存储。本身不持有样本，只有计数器。
pub struct SampleIngestor {
    store: Arc<SeriesStore>,
    clock: Arc<dyn Clock>,
    max_future_skew: chrono::Duration,
    counters: IngestCounters,
}

impl SampleIngestor {
    pub fn new(config: &IngestConfig, store: Arc<SeriesStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_future_skew: to_chrono(config.max_future_skew),
            counters: IngestCounters::default(),
        }
    }

    pub fn ingest(&self, sample: Sample) -> Result<AppendOutcome, IngestError> {
        let sample = match self.validate(sample) {
            Ok(sample) => sample,
            Err(err) => {
                let counter = match &err {
                    IngestError::InvalidValue { .. } => &self.counters.rejected_invalid_value,
                    IngestError::ClockSkew { .. } => &self.counters.rejected_clock_skew,
                    IngestError::EmptyMetricName => &self.counters.rejected_empty_name,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "Sample rejected");
                return Err(err);
            }
        };

        let outcome = self.store.append(&sample.key(), sample.point());
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    pub fn ingest_batch<I>(&self, samples: I) -> IngestReport
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut report = IngestReport::default();
        for sample in samples {
            match self.ingest(sample) {
                Ok(outcome) => {
                    report.accepted += 1;
                    if outcome == AppendOutcome::Dropped {
                        report.dropped_out_of_order += 1;
                    }
                }
                Err(err) => {
                    report.rejected += 1;
                    report.errors.push(err.to_string());
                }
            }
        }
        report
    }

    fn validate(&self, mut sample: Sample) -> Result<Sample, IngestError> {
        let name = sample.metric_name.trim();
        if name.is_empty() {
            return Err(IngestError::EmptyMetricName);
        }
        if name.len() != sample.metric_name.len() {
            sample.metric_name = name.to_string();
        }

        if !sample.value.is_finite() {
            return Err(IngestError::InvalidValue {
                metric: sample.metric_name,
                value: sample.value,
            });
        }

        let ahead = sample.timestamp - self.clock.now();
        if ahead > self.max_future_skew {
            return Err(IngestError::ClockSkew {
                metric: sample.metric_name,
                ahead_ms: ahead.num_milliseconds(),
            });
        }

        sample.tags = std::mem::take(&mut sample.tags)
            .into_iter()
            .filter_map(|(k, v)| {
                let k = k.trim();
                (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
            })
            .collect();

        Ok(sample)
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected_invalid_value: self.counters.rejected_invalid_value.load(Ordering::Relaxed),
            rejected_clock_skew: self.counters.rejected_clock_skew.load(Ordering::Relaxed),
            rejected_empty_name: self.counters.rejected_empty_name.load(Ordering::Relaxed),
        }
    }
}

use crate::clock::{to_chrono, Clock};
use crate::error::{ConfigError, QueryError};
use crate::matcher::{Pattern, SeriesMatcher};
use crate::query::Aggregation;
use crate::sample::{SamplePoint, SeriesKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// 按指标名前缀指定的序列容量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityClass {
    pub pattern: String,
    pub capacity: usize,
}

/// 序列存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    pub default_capacity: usize,
    pub capacity_classes: Vec<CapacityClass>,
    #[serde(with = "humantime_serde")]
    pub reorder_tolerance: Duration,
    #[serde(with = "humantime_serde")]
    pub series_ttl: Duration,
    pub max_series: usize,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            default_capacity: 1000,
            capacity_classes: Vec::new(),
            reorder_tolerance: Duration::from_secs(5),
            series_ttl: Duration::from_secs(24 * 60 * 60),
            max_series: 100_000,
        }
    }
}

/// 追加结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 按时间顺序追加到末尾
    Appended,
    /// 迟到但在容忍范围内，插入到有序位置
    Reordered,
    /// 超出乱序容忍度被丢弃
    Dropped,
}

/// 单条序列：固定容量、按时间戳有序的环形缓冲
#[derive(Debug)]
struct Series {
    points: VecDeque<SamplePoint>,
    capacity: usize,
    created_at: DateTime<Utc>,
    last_query: Option<DateTime<Utc>>,
    /// 已从表中移除；持有旧句柄的写入方需要重新取句柄
    evicted: bool,
}

impl Series {
    fn new(capacity: usize, created_at: DateTime<Utc>) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            created_at,
            last_query: None,
            evicted: false,
        }
    }

    fn newest(&self) -> Option<&SamplePoint> {
        self.points.back()
    }

    fn append(&mut self, point: SamplePoint, tolerance: chrono::Duration) -> AppendOutcome {
        let outcome = match self.newest() {
            Some(newest) if point.timestamp < newest.timestamp => {
                if newest.timestamp - point.timestamp > tolerance {
                    return AppendOutcome::Dropped;
                }
                // 从尾部向前线性查找；相同时间戳的样本保持到达顺序
                let position = self
                    .points
                    .iter()
                    .rposition(|existing| existing.timestamp <= point.timestamp)
                    .map_or(0, |i| i + 1);
                self.points.insert(position, point);
                AppendOutcome::Reordered
            }
            _ => {
                self.points.push_back(point);
                AppendOutcome::Appended
            }
        };

        while self.points.len() > self.capacity {
            self.points.pop_front();
        }

        outcome
    }

    fn window(&self, cutoff: Option<DateTime<Utc>>) -> Vec<SamplePoint> {
        match cutoff {
            None => self.points.iter().copied().collect(),
            Some(cutoff) => {
                let start = self.points.partition_point(|p| p.timestamp < cutoff);
                self.points.range(start..).copied().collect()
            }
        }
    }

    /// 最近一次写入或查询的时间
    fn last_activity(&self) -> DateTime<Utc> {
        let written = self.newest().map_or(self.created_at, |p| p.timestamp);
        self.last_query.map_or(written, |queried| queried.max(written))
    }

    fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        let written = self.newest().map_or(self.created_at, |p| p.timestamp);
        let queried = self.last_query.unwrap_or(self.created_at);
        written < cutoff && queried < cutoff
    }

    fn summary(&self, key: &SeriesKey) -> Option<SeriesSummary> {
        let first = self.points.front()?;
        let last = self.points.back()?;
        let count = self.points.len();
        let mean = self.points.iter().map(|p| p.value).sum::<f64>() / count as f64;
        Some(SeriesSummary {
            identity: key.to_string(),
            key: key.clone(),
            latest: last.value,
            mean,
            count,
            first_timestamp: first.timestamp,
            last_timestamp: last.timestamp,
        })
    }
}

/// 序列摘要，供快照使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub identity: String,
    pub key: SeriesKey,
    pub latest: f64,
    pub mean: f64,
    pub count: usize,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

/// 存储统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub series_count: usize,
    pub series_created: u64,
    pub series_evicted: u64,
    pub out_of_order_dropped: u64,
    pub reordered: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    series_created: AtomicU64,
    series_evicted: AtomicU64,
    out_of_order_dropped: AtomicU64,
    reordered: AtomicU64,
}

type SeriesHandle = Arc<Mutex<Series>>;

fn lock(series: &Mutex<Series>) -> MutexGuard<'_, Series> {
    series.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 在序列锁内判断是否淘汰，并在同一把锁内打上标记
fn mark_evicted<F>(handle: &SeriesHandle, should_evict: F) -> bool
where
    F: FnOnce(&Series) -> bool,
{
    let mut series = lock(handle);
    if should_evict(&*series) {
        series.evicted = true;
        true
    } else {
        false
    }
}

/// 序列存储
///
/// 分片哈希表保存序列句柄，每条序列各自加锁：不同序列的读写互不阻塞。
/// 加锁顺序固定为先分片后序列。
pub struct SeriesStore {
    series: DashMap<SeriesKey, SeriesHandle>,
    capacity_classes: Vec<(Pattern, usize)>,
    config: SeriesConfig,
    reorder_tolerance: chrono::Duration,
    clock: Arc<dyn Clock>,
    counters: StoreCounters,
}

impl SeriesStore {
    pub fn new(config: SeriesConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if config.default_capacity == 0 {
            return Err(ConfigError::invalid("series.default_capacity must be greater than 0"));
        }
        if config.max_series == 0 {
            return Err(ConfigError::invalid("series.max_series must be greater than 0"));
        }

        let mut capacity_classes = Vec::with_capacity(config.capacity_classes.len());
        for class in &config.capacity_classes {
            if class.capacity == 0 {
                return Err(ConfigError::invalid(format!(
                    "capacity class {} must have a capacity greater than 0",
                    class.pattern
                )));
            }
            let pattern = Pattern::parse(&class.pattern)
                .map_err(|reason| ConfigError::selector(&class.pattern, reason))?;
            capacity_classes.push((pattern, class.capacity));
        }

        Ok(Self {
            series: DashMap::new(),
            capacity_classes,
            reorder_tolerance: to_chrono(config.reorder_tolerance),
            config,
            clock,
            counters: StoreCounters::default(),
        })
    }

    pub fn config(&self) -> &SeriesConfig {
        &self.config
    }

    /// 指标名对应的容量，第一个匹配的容量类生效
    pub fn capacity_for(&self, metric: &str) -> usize {
        self.capacity_classes
            .iter()
            .find(|(pattern, _)| pattern.matches(metric))
            .map_or(self.config.default_capacity, |(_, capacity)| *capacity)
    }

    fn handle(&self, key: &SeriesKey) -> Option<SeriesHandle> {
        // 先克隆句柄再释放分片锁
        self.series.get(key).map(|entry| entry.value().clone())
    }

    fn get_or_create(&self, key: &SeriesKey) -> SeriesHandle {
        if let Some(handle) = self.handle(key) {
            return handle;
        }

        let capacity = self.capacity_for(&key.metric);
        let now = self.clock.now();
        self.series
            .entry(key.clone())
            .or_insert_with(|| {
                self.counters.series_created.fetch_add(1, Ordering::Relaxed);
                debug!(series = %key, capacity, "Series created");
                Arc::new(Mutex::new(Series::new(capacity, now)))
            })
            .value()
            .clone()
    }

    /// 写入句柄对应的序列；序列已被淘汰时返回 None
    fn try_append(&self, handle: &SeriesHandle, point: SamplePoint) -> Option<AppendOutcome> {
        let mut series = lock(handle);
        if series.evicted {
            return None;
        }
        Some(series.append(point, self.reorder_tolerance))
    }

    /// 追加样本，序列不存在时创建
    ///
    /// 取句柄与加锁之间序列可能被淘汰，此时重新取句柄写入新序列。
    pub fn append(&self, key: &SeriesKey, point: SamplePoint) -> AppendOutcome {
        let outcome = loop {
            let handle = self.get_or_create(key);
            if let Some(outcome) = self.try_append(&handle, point) {
                break outcome;
            }
        };

        match outcome {
            AppendOutcome::Dropped => {
                self.counters.out_of_order_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(series = %key, timestamp = %point.timestamp, "Out-of-order sample dropped");
            }
            AppendOutcome::Reordered => {
                self.counters.reordered.fetch_add(1, Ordering::Relaxed);
            }
            AppendOutcome::Appended => {}
        }

        outcome
    }

    /// 对窗口 `[now - window, ∞)` 内的样本求聚合值；`window` 为空时使用整条序列
    pub fn query(
        &self,
        key: &SeriesKey,
        aggregation: Aggregation,
        window: Option<Duration>,
    ) -> Result<f64, QueryError> {
        aggregation.validate()?;
        let handle = self.handle(key).ok_or(QueryError::UnknownSeries)?;

        let now = self.clock.now();
        let cutoff = window.map(|w| now - to_chrono(w));
        let points = {
            let mut series = lock(&handle);
            series.last_query = Some(now);
            series.window(cutoff)
        };

        aggregation.apply(&points)
    }

    /// 最新样本，不更新查询时间
    pub fn latest(&self, key: &SeriesKey) -> Option<SamplePoint> {
        let handle = self.handle(key)?;
        let series = lock(&handle);
        series.newest().copied()
    }

    /// 序列当前保存的全部样本（按时间升序）
    pub fn samples(&self, key: &SeriesKey) -> Option<Vec<SamplePoint>> {
        let handle = self.handle(key)?;
        let series = lock(&handle);
        Some(series.window(None))
    }

    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.series.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        self.series.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 与选择器匹配的序列
    pub fn matching(&self, matcher: &SeriesMatcher) -> Vec<SeriesKey> {
        self.series
            .iter()
            .filter(|entry| matcher.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// 所有序列的摘要，按标识排序
    pub fn summaries(&self) -> Vec<SeriesSummary> {
        let handles: Vec<(SeriesKey, SeriesHandle)> = self
            .series
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut summaries: Vec<SeriesSummary> = handles
            .iter()
            .filter_map(|(key, handle)| lock(handle).summary(key))
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// 淘汰过期序列
    ///
    /// 先按 TTL 删除最新样本和最近查询都早于 `now - series_ttl` 的序列，
    /// 再在总数超过 `max_series` 时按最近活动时间淘汰最久未用的序列。
    /// `is_protected` 返回 true 的序列（例如仍有活动告警）不会被删除。
    pub fn evict_stale<F>(&self, now: DateTime<Utc>, is_protected: F) -> usize
    where
        F: Fn(&SeriesKey) -> bool,
    {
        let cutoff = now - to_chrono(self.config.series_ttl);

        let expired: Vec<SeriesKey> = self
            .series
            .iter()
            .filter(|entry| !is_protected(entry.key()) && lock(entry.value()).is_stale(cutoff))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            // 收集之后可能有新写入，删除前在锁内再确认一次
            if self
                .series
                .remove_if(&key, |_, handle| mark_evicted(handle, |series| series.is_stale(cutoff)))
                .is_some()
            {
                evicted += 1;
            }
        }

        let over = self.series.len().saturating_sub(self.config.max_series);
        if over > 0 {
            let mut candidates: Vec<(DateTime<Utc>, SeriesKey)> = self
                .series
                .iter()
                .filter(|entry| !is_protected(entry.key()))
                .map(|entry| (lock(entry.value()).last_activity(), entry.key().clone()))
                .collect();
            candidates.sort();

            for (seen, key) in candidates.into_iter().take(over) {
                if self
                    .series
                    .remove_if(&key, |_, handle| {
                        mark_evicted(handle, |series| series.last_activity() <= seen)
                    })
                    .is_some()
                {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.counters
                .series_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, remaining = self.series.len(), "Evicted stale series");
        }

        evicted
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            series_count: self.series.len(),
            series_created: self.counters.series_created.load(Ordering::Relaxed),
            series_evicted: self.counters.series_evicted.load(Ordering::Relaxed),
            out_of_order_dropped: self.counters.out_of_order_dropped.load(Ordering::Relaxed),
            reordered: self.counters.reordered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn store_with(config: SeriesConfig) -> (SeriesStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = SeriesStore::new(config, clock.clone()).unwrap();
        (store, clock)
    }

    fn point(clock: &ManualClock, offset_secs: i64, value: f64) -> SamplePoint {
        SamplePoint::new(clock.now() + ChronoDuration::seconds(offset_secs), value)
    }

    #[test]
    fn test_latest_follows_in_order_appends() {
        let (store, clock) = store_with(SeriesConfig::default());
        let key = SeriesKey::new("cpu");

        for (i, v) in [3.0, 7.0, 1.0, 9.0].iter().enumerate() {
            assert_eq!(store.append(&key, point(&clock, i as i64, *v)), AppendOutcome::Appended);
            assert_eq!(store.query(&key, Aggregation::Latest, None).unwrap(), *v);
        }
    }

    #[test]
    fn test_capacity_keeps_most_recent_by_timestamp() {
        let config = SeriesConfig {
            default_capacity: 3,
            ..SeriesConfig::default()
        };
        let (store, clock) = store_with(config);
        let key = SeriesKey::new("mem");

        let appended: Vec<SamplePoint> = (0..5).map(|i| point(&clock, i, i as f64)).collect();
        for p in &appended {
            store.append(&key, *p);
        }

        // 按时间戳核对保留的是最后三个样本
        let kept: Vec<_> = store.samples(&key).unwrap().iter().map(|p| p.timestamp).collect();
        let expected: Vec<_> = appended[2..].iter().map(|p| p.timestamp).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_late_sample_within_tolerance_is_sorted_in() {
        let (store, clock) = store_with(SeriesConfig::default());
        let key = SeriesKey::new("net");

        store.append(&key, point(&clock, 0, 1.0));
        store.append(&key, point(&clock, 10, 3.0));
        assert_eq!(store.append(&key, point(&clock, 7, 2.0)), AppendOutcome::Reordered);

        let values: Vec<f64> = store.samples(&key).unwrap().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(store.query(&key, Aggregation::Latest, None).unwrap(), 3.0);
        assert_eq!(store.stats().reordered, 1);
    }

    #[test]
    fn test_sample_beyond_tolerance_is_dropped() {
        let (store, clock) = store_with(SeriesConfig::default());
        let key = SeriesKey::new("disk");

        store.append(&key, point(&clock, 60, 42.0));
        assert_eq!(store.append(&key, point(&clock, 50, 1.0)), AppendOutcome::Dropped);

        assert_eq!(store.query(&key, Aggregation::Latest, None).unwrap(), 42.0);
        assert_eq!(store.query(&key, Aggregation::Count, None).unwrap(), 1.0);
        assert_eq!(store.stats().out_of_order_dropped, 1);
    }

    #[test]
    fn test_query_window_and_errors() {
        let (store, clock) = store_with(SeriesConfig::default());
        let key = SeriesKey::new("load");

        store.append(&key, point(&clock, -120, 100.0));
        store.append(&key, point(&clock, -20, 2.0));
        store.append(&key, point(&clock, -10, 4.0));

        let window = Some(Duration::from_secs(60));
        assert_eq!(store.query(&key, Aggregation::Mean, window).unwrap(), 3.0);
        assert_eq!(store.query(&key, Aggregation::Max, None).unwrap(), 100.0);
        assert_eq!(
            store.query(&key, Aggregation::Latest, Some(Duration::from_secs(5))),
            Err(QueryError::Insufficient)
        );
        assert_eq!(
            store.query(&SeriesKey::new("missing"), Aggregation::Latest, None),
            Err(QueryError::UnknownSeries)
        );
    }

    #[test]
    fn test_capacity_classes() {
        let config = SeriesConfig {
            capacity_classes: vec![CapacityClass {
                pattern: "cpu.*".to_string(),
                capacity: 2,
            }],
            ..SeriesConfig::default()
        };
        let (store, clock) = store_with(config);
        assert_eq!(store.capacity_for("cpu.user"), 2);
        assert_eq!(store.capacity_for("mem.used"), 1000);

        let key = SeriesKey::new("cpu.user");
        for i in 0..5 {
            store.append(&key, point(&clock, i, i as f64));
        }
        assert_eq!(store.samples(&key).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let zero = SeriesConfig {
            default_capacity: 0,
            ..SeriesConfig::default()
        };
        assert!(SeriesStore::new(zero, clock.clone()).is_err());

        let bad_class = SeriesConfig {
            capacity_classes: vec![CapacityClass {
                pattern: "c*u".to_string(),
                capacity: 10,
            }],
            ..SeriesConfig::default()
        };
        assert!(SeriesStore::new(bad_class, clock).is_err());
    }

    #[test]
    fn test_evict_stale_requires_old_write_and_old_query() {
        let config = SeriesConfig {
            series_ttl: Duration::from_secs(3600),
            ..SeriesConfig::default()
        };
        let (store, clock) = store_with(config);
        let idle = SeriesKey::new("idle");
        let watched = SeriesKey::new("watched");

        store.append(&idle, point(&clock, 0, 1.0));
        store.append(&watched, point(&clock, 0, 1.0));

        clock.advance(ChronoDuration::minutes(90));
        // 最近被查询过的序列保留
        store.query(&watched, Aggregation::Latest, None).unwrap();

        assert_eq!(store.evict_stale(clock.now(), |_| false), 1);
        assert!(!store.contains(&idle));
        assert!(store.contains(&watched));
        assert_eq!(store.stats().series_evicted, 1);
    }

    #[test]
    fn test_append_racing_eviction_lands_in_live_series() {
        let config = SeriesConfig {
            series_ttl: Duration::from_secs(60),
            ..SeriesConfig::default()
        };
        let (store, clock) = store_with(config);
        let key = SeriesKey::new("racy");
        store.append(&key, point(&clock, 0, 1.0));
        clock.advance(ChronoDuration::hours(2));

        // 写入方已取到句柄，随后序列被淘汰
        let stale = store.get_or_create(&key);
        assert_eq!(store.evict_stale(clock.now(), |_| false), 1);
        assert!(store.try_append(&stale, point(&clock, 0, 5.0)).is_none());

        assert_eq!(store.append(&key, point(&clock, 0, 5.0)), AppendOutcome::Appended);
        assert!(store.contains(&key));
        assert_eq!(store.latest(&key).map(|p| p.value), Some(5.0));
        assert_eq!(store.stats().series_created, 2);
    }

    #[test]
    fn test_evict_skips_protected_series() {
        let config = SeriesConfig {
            series_ttl: Duration::from_secs(60),
            ..SeriesConfig::default()
        };
        let (store, clock) = store_with(config);
        let key = SeriesKey::new("alerting");
        store.append(&key, point(&clock, 0, 1.0));

        clock.advance(ChronoDuration::hours(2));
        assert_eq!(store.evict_stale(clock.now(), |k| k == &key), 0);
        assert!(store.contains(&key));
    }

    #[test]
    fn test_max_series_evicts_least_recent() {
        let config = SeriesConfig {
            max_series: 2,
            ..SeriesConfig::default()
        };
        let (store, clock) = store_with(config);

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            store.append(&SeriesKey::new(*name), point(&clock, i as i64, 1.0));
        }

        assert_eq!(store.evict_stale(clock.now(), |_| false), 1);
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&SeriesKey::new("a")));
    }

    #[test]
    fn test_summaries_sorted_by_key() {
        let (store, clock) = store_with(SeriesConfig::default());
        store.append(&SeriesKey::new("b"), point(&clock, 0, 2.0));
        store.append(&SeriesKey::new("a"), point(&clock, 0, 1.0));
        store.append(&SeriesKey::new("a"), point(&clock, 1, 3.0));

        let summaries = store.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].identity, "a");
        assert_eq!(summaries[0].latest, 3.0);
        assert_eq!(summaries[0].mean, 2.0);
        assert_eq!(summaries[0].count, 2);
    }

    #[test]
    fn test_concurrent_appends_to_distinct_series() {
        let (store, clock) = store_with(SeriesConfig::default());
        let store = Arc::new(store);
        let base = clock.now();

        let workers: Vec<_> = (0..8)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = SeriesKey::new("req").with_tag("worker", w.to_string());
                    for i in 0..200 {
                        let ts = base + ChronoDuration::milliseconds(i);
                        store.append(&key, SamplePoint::new(ts, i as f64));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(store.len(), 8);
        for summary in store.summaries() {
            assert_eq!(summary.count, 200);
            assert_eq!(summary.latest, 199.0);
        }
        assert_eq!(store.stats().series_created, 8);
    }
}

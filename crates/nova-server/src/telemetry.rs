use nova_metrics::Snapshot;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, PoisonError};

/// Prometheus 导出
///
/// 每次渲染都从同一个快照写入全部指标，渲染过程串行。
/// 累计量按计数器导出，每次只补上与上次渲染之间的差值。
pub struct Telemetry {
    samples_accepted: IntCounter,
    samples_rejected: IntCounterVec,
    samples_reordered: IntCounter,

    series_active: IntGauge,
    series_created: IntCounter,
    series_evicted: IntCounter,

    alerts: IntGaugeVec,

    evaluator_ticks: IntCounterVec,
    evaluator_rules_evaluated: IntCounter,
    evaluator_rule_failures: IntCounter,
    evaluator_active_rules: IntGauge,
    evaluator_last_tick_seconds: Gauge,
    evaluator_last_evaluation: Gauge,

    uptime_seconds: Gauge,

    registry: Registry,
    render_lock: Mutex<()>,
}

impl Telemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // 写入路径
        let samples_accepted = IntCounter::new("nova_samples_accepted_total", "Samples accepted since start")?;
        registry.register(Box::new(samples_accepted.clone()))?;

        let samples_rejected = IntCounterVec::new(
            Opts::new("nova_samples_rejected_total", "Samples rejected or dropped since start"),
            &["reason"],
        )?;
        registry.register(Box::new(samples_rejected.clone()))?;

        let samples_reordered = IntCounter::new(
            "nova_samples_reordered_total",
            "Late samples inserted within the reorder tolerance",
        )?;
        registry.register(Box::new(samples_reordered.clone()))?;

        // 序列
        let series_active = IntGauge::new("nova_series_active", "Series currently held in memory")?;
        registry.register(Box::new(series_active.clone()))?;

        let series_created = IntCounter::new("nova_series_created_total", "Series created since start")?;
        registry.register(Box::new(series_created.clone()))?;

        let series_evicted = IntCounter::new("nova_series_evicted_total", "Series evicted since start")?;
        registry.register(Box::new(series_evicted.clone()))?;

        // 告警
        let alerts = IntGaugeVec::new(
            Opts::new("nova_alerts", "Alerts by lifecycle state"),
            &["state"],
        )?;
        registry.register(Box::new(alerts.clone()))?;

        // 评估器
        let evaluator_ticks = IntCounterVec::new(
            Opts::new("nova_evaluator_ticks_total", "Evaluation ticks by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(evaluator_ticks.clone()))?;

        let evaluator_rules_evaluated =
            IntCounter::new("nova_evaluator_rules_evaluated_total", "Rule evaluations since start")?;
        registry.register(Box::new(evaluator_rules_evaluated.clone()))?;

        let evaluator_rule_failures =
            IntCounter::new("nova_evaluator_rule_failures_total", "Failed rule evaluations since start")?;
        registry.register(Box::new(evaluator_rule_failures.clone()))?;

        let evaluator_active_rules = IntGauge::new("nova_evaluator_active_rules", "Rules loaded")?;
        registry.register(Box::new(evaluator_active_rules.clone()))?;

        let evaluator_last_tick_seconds = Gauge::new(
            "nova_evaluator_last_tick_duration_seconds",
            "Duration of the last evaluation tick",
        )?;
        registry.register(Box::new(evaluator_last_tick_seconds.clone()))?;

        let evaluator_last_evaluation = Gauge::new(
            "nova_evaluator_last_evaluation_timestamp_seconds",
            "Unix time of the last completed evaluation, 0 before the first",
        )?;
        registry.register(Box::new(evaluator_last_evaluation.clone()))?;

        let uptime_seconds = Gauge::new("nova_uptime_seconds", "Seconds since the server started")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            samples_accepted,
            samples_rejected,
            samples_reordered,
            series_active,
            series_created,
            series_evicted,
            alerts,
            evaluator_ticks,
            evaluator_rules_evaluated,
            evaluator_rule_failures,
            evaluator_active_rules,
            evaluator_last_tick_seconds,
            evaluator_last_evaluation,
            uptime_seconds,
            registry,
            render_lock: Mutex::new(()),
        })
    }

    fn observe(&self, snapshot: &Snapshot, uptime_seconds: f64) {
        let ingest = &snapshot.ingest;
        let store = &snapshot.store;
        let evaluator = &snapshot.evaluator;
        let counts = &snapshot.alert_counts;

        catch_up(&self.samples_accepted, ingest.accepted);
        for (reason, value) in [
            ("invalid_value", ingest.rejected_invalid_value),
            ("clock_skew", ingest.rejected_clock_skew),
            ("empty_name", ingest.rejected_empty_name),
            ("out_of_order", store.out_of_order_dropped),
        ] {
            catch_up(&self.samples_rejected.with_label_values(&[reason]), value);
        }
        catch_up(&self.samples_reordered, store.reordered);

        self.series_active.set(as_i64(store.series_count as u64));
        catch_up(&self.series_created, store.series_created);
        catch_up(&self.series_evicted, store.series_evicted);

        for (state, value) in [
            ("pending", counts.pending),
            ("firing", counts.firing),
            ("resolved", counts.resolved),
        ] {
            self.alerts.with_label_values(&[state]).set(as_i64(value as u64));
        }

        catch_up(
            &self.evaluator_ticks.with_label_values(&["completed"]),
            evaluator.ticks_completed,
        );
        catch_up(
            &self.evaluator_ticks.with_label_values(&["cancelled"]),
            evaluator.ticks_cancelled,
        );
        catch_up(&self.evaluator_rules_evaluated, evaluator.rules_evaluated);
        catch_up(&self.evaluator_rule_failures, evaluator.rule_failures);
        self.evaluator_active_rules.set(as_i64(evaluator.active_rules as u64));
        self.evaluator_last_tick_seconds
            .set(evaluator.last_tick_duration_ms as f64 / 1000.0);
        self.evaluator_last_evaluation.set(
            evaluator
                .last_evaluation
                .map(|at| at.timestamp_millis() as f64 / 1000.0)
                .unwrap_or(0.0),
        );

        self.uptime_seconds.set(uptime_seconds);
    }

    /// 以文本格式导出
    pub fn render(&self, snapshot: &Snapshot, uptime_seconds: f64) -> Result<String, prometheus::Error> {
        let _guard = self.render_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.observe(snapshot, uptime_seconds);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// 计数器只增不减；快照值回退时保持原值
fn catch_up(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

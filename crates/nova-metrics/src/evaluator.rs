use crate::alert::{AlertKey, AlertState, ResolveReason, Transition, Trigger};
use crate::clock::{to_chrono, Clock};
use crate::error::{ConfigError, EvaluationError};
use crate::registry::AlertRegistry;
use crate::rule::Rule;
use crate::sample::SeriesKey;
use crate::snapshot::ConsistencyGate;
use crate::store::SeriesStore;
use chrono::{DateTime, Utc};
use nova_shutdown::ShutdownListener;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 评估器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// 缺省为两个评估周期
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub missing_data_grace: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(15),
            missing_data_grace: None,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl EvaluatorConfig {
    pub fn grace(&self) -> Duration {
        self.missing_data_grace.unwrap_or(self.period * 2)
    }
}

/// 评估器健康状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorHealth {
    pub ticks_completed: u64,
    pub ticks_cancelled: u64,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub last_tick_duration_ms: u64,
    pub rules_evaluated: u64,
    pub rule_failures: u64,
    pub active_rules: usize,
}

/// 单次评估结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rules_evaluated: usize,
    pub rule_failures: usize,
    pub cancelled: bool,
}

type RuleSet = Arc<Vec<Arc<Rule>>>;

/// 规则评估器
///
/// 每个周期取一次规则集快照，逐条规则评估。规则之间检查关闭信号，
/// 单条规则失败只记录日志，不影响其余规则。
pub struct RuleEvaluator {
    rules: RwLock<RuleSet>,
    store: Arc<SeriesStore>,
    registry: Arc<AlertRegistry>,
    clock: Arc<dyn Clock>,
    gate: ConsistencyGate,
    config: EvaluatorConfig,
    grace: chrono::Duration,
    health: Mutex<EvaluatorHealth>,
}

impl RuleEvaluator {
    pub fn new(
        config: EvaluatorConfig,
        rules: Vec<Rule>,
        store: Arc<SeriesStore>,
        registry: Arc<AlertRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if config.period.is_zero() {
            return Err(ConfigError::invalid("evaluator.period must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id().to_string()) {
                return Err(ConfigError::DuplicateRuleId(rule.id().to_string()));
            }
        }

        let health = EvaluatorHealth {
            active_rules: rules.len(),
            ..EvaluatorHealth::default()
        };

        Ok(Self {
            rules: RwLock::new(Arc::new(rules.into_iter().map(Arc::new).collect())),
            store,
            registry,
            clock,
            gate: ConsistencyGate::default(),
            grace: to_chrono(config.grace()),
            config,
            health: Mutex::new(health),
        })
    }

    /// 与快照发布器共用的一致性闸门
    pub fn with_gate(mut self, gate: ConsistencyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// 当前规则集快照
    pub fn rules(&self) -> RuleSet {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rule_ids(&self) -> HashSet<String> {
        self.rules().iter().map(|rule| rule.id().to_string()).collect()
    }

    /// 运行时注册规则，正在进行的评估不受影响
    pub fn register_rule(&self, rule: Rule) -> Result<(), ConfigError> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.iter().any(|existing| existing.id() == rule.id()) {
            return Err(ConfigError::DuplicateRuleId(rule.id().to_string()));
        }

        info!(rule_id = %rule.id(), selector = %rule.matcher(), "Rule registered");
        let mut next = Vec::with_capacity(rules.len() + 1);
        next.extend(rules.iter().cloned());
        next.push(Arc::new(rule));
        *rules = Arc::new(next);
        self.set_active_rules(rules.len());
        Ok(())
    }

    /// 移除规则；遗留告警由下一次维护解除
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if !rules.iter().any(|rule| rule.id() == rule_id) {
            return false;
        }

        let next: Vec<Arc<Rule>> = rules
            .iter()
            .filter(|rule| rule.id() != rule_id)
            .cloned()
            .collect();
        *rules = Arc::new(next);
        self.set_active_rules(rules.len());
        info!(rule_id = %rule_id, "Rule removed");
        true
    }

    fn set_active_rules(&self, count: usize) {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active_rules = count;
    }

    pub fn health(&self) -> EvaluatorHealth {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 周期性评估，直到收到关闭信号
    pub async fn run(&self, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period = ?self.config.period,
            missing_data_grace = ?self.config.grace(),
            rules = self.rules().len(),
            "Rule evaluator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let report = self.tick(&shutdown).await;
            if report.cancelled {
                break;
            }
        }

        info!("Rule evaluator stopped");
    }

    /// 执行一次评估
    pub async fn tick(&self, shutdown: &ShutdownListener) -> TickReport {
        let started = Instant::now();
        let rules = self.rules();
        let now = self.clock.now();
        let mut report = TickReport::default();

        for rule in rules.iter() {
            if shutdown.is_shutdown() {
                report.cancelled = true;
                break;
            }

            match self.evaluate_rule(rule, now).await {
                Ok(()) => report.rules_evaluated += 1,
                Err(err) => {
                    report.rule_failures += 1;
                    warn!(rule_id = %rule.id(), error = %err, "Rule evaluation failed");
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        {
            let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
            if report.cancelled {
                health.ticks_cancelled += 1;
            } else {
                health.ticks_completed += 1;
                health.last_evaluation = Some(now);
            }
            health.last_tick_duration_ms = elapsed_ms;
            health.rules_evaluated += report.rules_evaluated as u64;
            health.rule_failures += report.rule_failures as u64;
            health.active_rules = rules.len();
        }

        if report.cancelled {
            info!(evaluated = report.rules_evaluated, "Evaluation tick cancelled by shutdown");
        } else {
            debug!(
                evaluated = report.rules_evaluated,
                failures = report.rule_failures,
                elapsed_ms,
                "Evaluation tick completed"
            );
        }

        report
    }

    async fn evaluate_rule(&self, rule: &Rule, now: DateTime<Utc>) -> Result<(), EvaluationError> {
        // 持有读闸门期间序列不会被淘汰
        let _gate = self.gate.read().await;

        let mut series: BTreeSet<SeriesKey> = self.store.matching(rule.matcher()).into_iter().collect();
        series.extend(self.registry.open_series(rule.id()).await);

        let mut failure = None;
        for key in &series {
            if let Err(err) = self.evaluate_series(rule, key, now).await {
                failure = Some(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn evaluate_series(
        &self,
        rule: &Rule,
        key: &SeriesKey,
        now: DateTime<Utc>,
    ) -> Result<(), EvaluationError> {
        let alert_key = AlertKey::new(rule.id(), key.clone());
        let current = self.registry.current(&alert_key).await;

        let (target, value) = match rule.value(&self.store, key) {
            Ok(value) if !value.is_finite() => {
                return Err(EvaluationError::NonFiniteValue {
                    rule_id: rule.id().to_string(),
                    series: key.to_string(),
                    value,
                });
            }
            Ok(value) if rule.breached(value) => {
                let trigger = Trigger::new(rule.severity(), rule.message(key, value));
                let target = match &current {
                    Some(alert) if alert.state == AlertState::Pending => {
                        if now - alert.first_triggered >= to_chrono(rule.duration()) {
                            Transition::Firing(trigger)
                        } else {
                            Transition::Pending(trigger)
                        }
                    }
                    Some(_) => Transition::Firing(trigger),
                    None if rule.duration().is_zero() => Transition::Firing(trigger),
                    None => Transition::Pending(trigger),
                };
                (target, value)
            }
            Ok(value) => {
                let target = match current.as_ref().map(|alert| alert.state) {
                    Some(AlertState::Pending) => Transition::Discard,
                    Some(AlertState::Firing) => Transition::Resolve(ResolveReason::ConditionCleared),
                    _ => return Ok(()),
                };
                (target, value)
            }
            Err(err) => {
                // 缺数据视为条件不成立；Firing 告警保持到宽限期结束
                let target = match &current {
                    Some(alert) if alert.state == AlertState::Pending => Transition::Discard,
                    Some(alert)
                        if alert.state == AlertState::Firing
                            && now - alert.last_evaluated > self.grace =>
                    {
                        Transition::Resolve(ResolveReason::StaleData)
                    }
                    Some(_) => {
                        debug!(rule_id = %rule.id(), series = %key, error = %err, "No data, holding alert state");
                        return Ok(());
                    }
                    None => return Ok(()),
                };
                (target, f64::NAN)
            }
        };

        self.registry.transition(&alert_key, target, now, value).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::RegistryConfig;
    use crate::rule::{Comparator, RuleDefinition};
    use crate::sample::SamplePoint;
    use crate::store::SeriesConfig;
    use chrono::Duration as ChronoDuration;
    use nova_shutdown::SignalHandler;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<SeriesStore>,
        registry: Arc<AlertRegistry>,
        evaluator: RuleEvaluator,
    }

    fn fixture(rules: Vec<RuleDefinition>) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(SeriesStore::new(SeriesConfig::default(), clock.clone()).unwrap());
        let registry = Arc::new(AlertRegistry::new(RegistryConfig::default()));
        let rules = rules.iter().map(|def| def.compile().unwrap()).collect();
        let evaluator = RuleEvaluator::new(
            EvaluatorConfig::default(),
            rules,
            store.clone(),
            registry.clone(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            clock,
            store,
            registry,
            evaluator,
        }
    }

    impl Fixture {
        fn push(&self, key: &SeriesKey, value: f64) {
            self.store.append(key, SamplePoint::new(self.clock.now(), value));
        }

        async fn tick_after(&self, secs: i64) -> TickReport {
            self.clock.advance(ChronoDuration::seconds(secs));
            self.evaluator.tick(&ShutdownListener::never()).await
        }
    }

    #[tokio::test]
    async fn test_failing_rule_does_not_stop_others() {
        let f = fixture(vec![
            RuleDefinition::threshold("sum-overflow", "big", Comparator::GreaterThan, 0.0)
                .with_aggregation(crate::query::Aggregation::Sum),
            RuleDefinition::threshold("healthy", "cpu", Comparator::GreaterThan, 10.0),
        ]);
        let big = SeriesKey::new("big");
        f.push(&big, f64::MAX);
        f.push(&big, f64::MAX);
        f.push(&SeriesKey::new("cpu"), 11.0);

        let report = f.tick_after(1).await;
        assert_eq!(report.rule_failures, 1);
        assert_eq!(report.rules_evaluated, 1);
        assert_eq!(f.registry.active_alerts().await.len(), 1);
        assert_eq!(f.evaluator.health().rule_failures, 1);
    }

    #[tokio::test]
    async fn test_tick_cancelled_between_rules() {
        let f = fixture(vec![
            RuleDefinition::threshold("a", "cpu", Comparator::GreaterThan, 10.0),
            RuleDefinition::threshold("b", "cpu", Comparator::GreaterThan, 10.0),
        ]);
        f.push(&SeriesKey::new("cpu"), 11.0);

        let (handler, listener) = SignalHandler::new();
        handler.trigger_shutdown();
        let report = f.evaluator.tick(&listener).await;

        assert!(report.cancelled);
        assert_eq!(report.rules_evaluated, 0);
        assert!(f.registry.active_alerts().await.is_empty());
        let health = f.evaluator.health();
        assert_eq!(health.ticks_cancelled, 1);
        assert_eq!(health.last_evaluation, None);
    }

    #[tokio::test]
    async fn test_runtime_registration() {
        let f = fixture(vec![]);
        let rule = RuleDefinition::threshold("late", "mem", Comparator::LessThan, 5.0)
            .compile()
            .unwrap();
        f.evaluator.register_rule(rule.clone()).unwrap();
        assert!(matches!(
            f.evaluator.register_rule(rule),
            Err(ConfigError::DuplicateRuleId(_))
        ));

        f.push(&SeriesKey::new("mem"), 1.0);
        f.tick_after(1).await;
        assert_eq!(f.registry.active_alerts().await.len(), 1);

        assert!(f.evaluator.remove_rule("late"));
        assert!(!f.evaluator.remove_rule("late"));
        assert_eq!(f.evaluator.health().active_rules, 0);
        assert!(f.evaluator.rule_ids().is_empty());
    }

    #[tokio::test]
    async fn test_missing_data_discards_pending() {
        let f = fixture(vec![RuleDefinition::threshold("r", "cpu", Comparator::GreaterThan, 10.0)
            .with_duration(Duration::from_secs(120))
            .with_window(Duration::from_secs(20))]);
        f.push(&SeriesKey::new("cpu"), 11.0);

        f.tick_after(1).await;
        assert_eq!(f.registry.counts().await.pending, 1);

        // 数据移出窗口
        f.tick_after(30).await;
        assert!(f.registry.active_alerts().await.is_empty());
        assert_eq!(f.registry.counts().await.resolved, 0);
    }

    #[tokio::test]
    async fn test_firing_held_within_grace() {
        let f = fixture(vec![RuleDefinition::threshold("r", "cpu", Comparator::GreaterThan, 10.0)
            .with_window(Duration::from_secs(20))]);
        f.push(&SeriesKey::new("cpu"), 11.0);

        f.tick_after(1).await;
        assert_eq!(f.registry.counts().await.firing, 1);

        // 窗口已空，但仍在 30s 宽限期内
        f.tick_after(25).await;
        assert_eq!(f.registry.counts().await.firing, 1);

        f.tick_after(10).await;
        let counts = f.registry.counts().await;
        assert_eq!(counts.firing, 0);
        assert_eq!(counts.resolved, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = Arc::new(fixture(vec![]));
        let (handler, listener) = SignalHandler::new();

        let evaluator = f.clone();
        let task = tokio::spawn(async move { evaluator.evaluator.run(listener).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(f.evaluator.health().ticks_completed >= 1);
    }
}

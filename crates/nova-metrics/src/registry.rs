use crate::alert::{
    Alert, AlertCounts, AlertEvent, AlertEventKind, AlertId, AlertKey, AlertState, ResolveReason,
    Transition, Trigger,
};
use crate::clock::to_chrono;
use crate::sample::SeriesKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 告警注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub history_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub history_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub resolve_cooldown: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
            history_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            resolve_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Pending 或 Firing，每个键最多一个
    open: HashMap<AlertKey, Alert>,
    /// 每个键最近一次解除的告警，用于冷却期判断
    recently_resolved: HashMap<AlertKey, Alert>,
    /// 已解除告警，按解除时间先后排列
    history: VecDeque<Alert>,
}

impl State {
    fn sorted_open(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.open.values().cloned().collect();
        alerts.sort_by(|a, b| {
            a.first_triggered
                .cmp(&b.first_triggered)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.series.cmp(&b.series))
        });
        alerts
    }

    fn counts(&self) -> AlertCounts {
        let firing = self
            .open
            .values()
            .filter(|alert| alert.state == AlertState::Firing)
            .count();
        AlertCounts {
            pending: self.open.len() - firing,
            firing,
            resolved: self.history.len(),
        }
    }
}

/// 告警注册表
///
/// 告警状态的唯一修改者。同一 `(rule_id, series)` 的转换在写锁内串行执行，
/// 转换表之外的请求按空操作处理。
pub struct AlertRegistry {
    state: RwLock<State>,
    config: RegistryConfig,
    history_ttl: chrono::Duration,
    resolve_cooldown: chrono::Duration,
    events: broadcast::Sender<AlertEvent>,
}

impl AlertRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            history_ttl: to_chrono(config.history_ttl),
            resolve_cooldown: to_chrono(config.resolve_cooldown),
            config,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 订阅告警事件
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// 请求状态转换
    ///
    /// 转换生效（包括刷新已有告警）时返回告警 id，非法转换返回 `None`。
    pub async fn transition(
        &self,
        key: &AlertKey,
        target: Transition,
        at: DateTime<Utc>,
        value: f64,
    ) -> Option<AlertId> {
        let mut state = self.state.write().await;
        let current = state.open.remove(key);

        match (current, target) {
            (Some(mut alert), Transition::Pending(_)) if alert.state == AlertState::Pending => {
                touch(&mut alert, at, value);
                let id = alert.id;
                state.open.insert(key.clone(), alert);
                Some(id)
            }
            (Some(mut alert), Transition::Firing(trigger)) if alert.state == AlertState::Firing => {
                touch(&mut alert, at, value);
                alert.message = trigger.message;
                let id = alert.id;
                state.open.insert(key.clone(), alert);
                Some(id)
            }
            (Some(mut alert), Transition::Firing(trigger)) => {
                alert.state = AlertState::Firing;
                alert.fired_at = Some(at);
                alert.severity = trigger.severity;
                alert.message = trigger.message;
                touch(&mut alert, at, value);
                if state
                    .recently_resolved
                    .get(key)
                    .is_some_and(|previous| previous.id == alert.id)
                {
                    // 冷却期内复用的告警到这里才真正重新触发
                    state.recently_resolved.remove(key);
                    state.history.retain(|entry| entry.id != alert.id);
                    alert.retriggered += 1;
                }
                info!(alert_id = %alert.id, alert = %key, value, retriggered = alert.retriggered, "Alert firing");
                let id = alert.id;
                self.publish(AlertEventKind::Firing, &alert);
                state.open.insert(key.clone(), alert);
                Some(id)
            }
            (Some(alert), Transition::Discard) if alert.state == AlertState::Pending => {
                debug!(alert_id = %alert.id, alert = %key, "Pending alert discarded");
                Some(alert.id)
            }
            (Some(mut alert), Transition::Resolve(reason)) if alert.state == AlertState::Firing => {
                alert.state = AlertState::Resolved;
                alert.resolved_at = Some(at);
                alert.resolve_reason = Some(reason);
                alert.last_evaluated = at;
                if value.is_finite() {
                    alert.last_value = value;
                }
                info!(alert_id = %alert.id, alert = %key, reason = %reason, "Alert resolved");
                let id = alert.id;
                self.publish(AlertEventKind::Resolved, &alert);
                state.recently_resolved.insert(key.clone(), alert.clone());
                self.push_history(&mut state, alert);
                Some(id)
            }
            (Some(alert), _) => {
                state.open.insert(key.clone(), alert);
                None
            }
            (None, Transition::Pending(trigger)) => {
                Some(self.open(&mut state, key, AlertState::Pending, trigger, at, value))
            }
            (None, Transition::Firing(trigger)) => {
                Some(self.open(&mut state, key, AlertState::Firing, trigger, at, value))
            }
            (None, Transition::Resolve(_) | Transition::Discard) => None,
        }
    }

    fn open(
        &self,
        state: &mut State,
        key: &AlertKey,
        target: AlertState,
        trigger: Trigger,
        at: DateTime<Utc>,
        value: f64,
    ) -> AlertId {
        let revived = state
            .recently_resolved
            .get(key)
            .filter(|previous| self.within_cooldown(previous, at))
            .cloned();

        let alert = match revived {
            Some(mut alert) if target == AlertState::Firing => {
                // 冷却期内再次触发：沿用原告警 id
                state.recently_resolved.remove(key);
                state.history.retain(|entry| entry.id != alert.id);
                alert.state = AlertState::Firing;
                alert.fired_at = Some(at);
                alert.resolved_at = None;
                alert.resolve_reason = None;
                alert.severity = trigger.severity;
                alert.message = trigger.message;
                alert.retriggered += 1;
                touch(&mut alert, at, value);
                info!(alert_id = %alert.id, alert = %key, value, retriggered = alert.retriggered, "Alert re-triggered within cooldown");
                self.publish(AlertEventKind::Firing, &alert);
                alert
            }
            Some(mut alert) => {
                // 沿用原告警 id 重新进入 Pending，持续时间从头计算；
                // 解除记录保留到真正触发为止，被丢弃时历史不变
                alert.state = AlertState::Pending;
                alert.first_triggered = at;
                alert.fired_at = None;
                alert.resolved_at = None;
                alert.resolve_reason = None;
                alert.severity = trigger.severity;
                alert.message = trigger.message;
                touch(&mut alert, at, value);
                debug!(alert_id = %alert.id, alert = %key, value, "Alert pending again within cooldown");
                self.publish(AlertEventKind::Pending, &alert);
                alert
            }
            None => {
                let alert = Alert::open(key, target, trigger.severity, trigger.message, at, value);
                match target {
                    AlertState::Firing => {
                        info!(alert_id = %alert.id, alert = %key, value, "Alert firing");
                        self.publish(AlertEventKind::Firing, &alert);
                    }
                    _ => {
                        debug!(alert_id = %alert.id, alert = %key, value, "Alert pending");
                        self.publish(AlertEventKind::Pending, &alert);
                    }
                }
                alert
            }
        };

        let id = alert.id;
        state.open.insert(key.clone(), alert);
        id
    }

    fn within_cooldown(&self, previous: &Alert, at: DateTime<Utc>) -> bool {
        previous.resolve_reason != Some(ResolveReason::StaleData)
            && previous
                .resolved_at
                .is_some_and(|resolved| at - resolved < self.resolve_cooldown)
    }

    fn push_history(&self, state: &mut State, alert: Alert) {
        state.history.push_back(alert);
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }
    }

    fn publish(&self, kind: AlertEventKind, alert: &Alert) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(AlertEvent {
            kind,
            alert: alert.clone(),
        });
    }

    pub async fn current(&self, key: &AlertKey) -> Option<Alert> {
        self.state.read().await.open.get(key).cloned()
    }

    /// Pending 和 Firing 告警，按首次触发时间排序
    pub async fn active_alerts(&self) -> Vec<Alert> {
        let state = self.state.read().await;
        state.sorted_open()
    }

    /// 在同一次读锁内取活动告警和计数
    pub async fn overview(&self) -> (Vec<Alert>, AlertCounts) {
        let state = self.state.read().await;
        (state.sorted_open(), state.counts())
    }

    /// `since` 之后解除的告警，按解除时间先后排列
    pub async fn history(&self, since: DateTime<Utc>) -> Vec<Alert> {
        let state = self.state.read().await;
        state
            .history
            .iter()
            .filter(|alert| alert.resolved_at.is_some_and(|resolved| resolved >= since))
            .cloned()
            .collect()
    }

    pub async fn counts(&self) -> AlertCounts {
        self.state.read().await.counts()
    }

    /// 某条规则下仍有活动告警的序列
    pub async fn open_series(&self, rule_id: &str) -> Vec<SeriesKey> {
        let state = self.state.read().await;
        state
            .open
            .keys()
            .filter(|key| key.rule_id == rule_id)
            .map(|key| key.series.clone())
            .collect()
    }

    /// 所有仍有活动告警的序列
    pub async fn active_series(&self) -> HashSet<SeriesKey> {
        let state = self.state.read().await;
        state.open.keys().map(|key| key.series.clone()).collect()
    }

    /// 按保留时长清理历史，并丢弃超出冷却期的解除记录
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write().await;
        let history_cutoff = now - self.history_ttl;
        let before = state.history.len();
        while state
            .history
            .front()
            .is_some_and(|alert| alert.resolved_at.map_or(true, |r| r < history_cutoff))
        {
            state.history.pop_front();
        }

        let cooldown_cutoff = now - self.resolve_cooldown;
        state
            .recently_resolved
            .retain(|_, alert| alert.resolved_at.is_some_and(|r| r >= cooldown_cutoff));

        let pruned = before - state.history.len();
        if pruned > 0 {
            debug!(pruned, "Pruned alert history");
        }
        pruned
    }

    /// 解除不再属于任何已注册规则的告警
    pub async fn resolve_orphans(&self, rule_ids: &HashSet<String>, now: DateTime<Utc>) -> usize {
        let orphaned: Vec<(AlertKey, AlertState, f64)> = {
            let state = self.state.read().await;
            state
                .open
                .iter()
                .filter(|(key, _)| !rule_ids.contains(&key.rule_id))
                .map(|(key, alert)| (key.clone(), alert.state, alert.last_value))
                .collect()
        };

        let mut resolved = 0;
        for (key, state, value) in orphaned {
            let target = match state {
                AlertState::Firing => Transition::Resolve(ResolveReason::RuleRemoved),
                _ => Transition::Discard,
            };
            if self.transition(&key, target, now, value).await.is_some() {
                resolved += 1;
            }
        }
        resolved
    }
}

fn touch(alert: &mut Alert, at: DateTime<Utc>, value: f64) {
    alert.last_evaluated = at;
    alert.last_value = value;
}

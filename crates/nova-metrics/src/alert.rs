use crate::rule::Severity;
use crate::sample::SeriesKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 告警 id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 告警状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Pending,
    Firing,
    Resolved,
}

/// 告警解除原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveReason {
    /// 条件不再成立
    ConditionCleared,
    /// 超过宽限期仍无数据
    StaleData,
    /// 规则已被移除
    RuleRemoved,
}

impl fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveReason::ConditionCleared => f.write_str("condition_cleared"),
            ResolveReason::StaleData => f.write_str("stale_data"),
            ResolveReason::RuleRemoved => f.write_str("rule_removed"),
        }
    }
}

/// 触发信息，打开或更新告警时使用
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub severity: Severity,
    pub message: String,
}

impl Trigger {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// 状态机的目标
///
/// 评估器只提出转换请求，是否生效由告警注册表按转换表决定。
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Pending(Trigger),
    Firing(Trigger),
    /// Firing → Resolved
    Resolve(ResolveReason),
    /// Pending → 不存在，不留历史
    Discard,
}

/// 告警去重键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub rule_id: String,
    pub series: SeriesKey,
}

impl AlertKey {
    pub fn new(rule_id: impl Into<String>, series: SeriesKey) -> Self {
        Self {
            rule_id: rule_id.into(),
            series,
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.series)
    }
}

/// 告警实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub rule_id: String,
    pub series: SeriesKey,
    pub series_identity: String,
    pub severity: Severity,
    pub state: AlertState,
    pub message: String,
    pub first_triggered: DateTime<Utc>,
    pub last_evaluated: DateTime<Utc>,
    pub value_at_trigger: f64,
    pub last_value: f64,
    pub fired_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolve_reason: Option<ResolveReason>,
    /// 冷却期内再次触发的次数
    pub retriggered: u32,
}

impl Alert {
    pub(crate) fn open(
        key: &AlertKey,
        state: AlertState,
        severity: Severity,
        message: String,
        at: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            id: AlertId::new(),
            rule_id: key.rule_id.clone(),
            series_identity: key.series.to_string(),
            series: key.series.clone(),
            severity,
            state,
            message,
            first_triggered: at,
            last_evaluated: at,
            value_at_trigger: value,
            last_value: value,
            fired_at: (state == AlertState::Firing).then_some(at),
            resolved_at: None,
            resolve_reason: None,
            retriggered: 0,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey::new(self.rule_id.clone(), self.series.clone())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AlertState::Pending | AlertState::Firing)
    }
}

/// 告警事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEventKind {
    Pending,
    Firing,
    Resolved,
}

/// 告警状态变化事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: Alert,
}

/// 告警数量统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCounts {
    pub pending: usize,
    pub firing: usize,
    pub resolved: usize,
}

impl AlertCounts {
    pub fn active(&self) -> usize {
        self.pending + self.firing
    }

    /// 活动告警加保留的历史
    pub fn total(&self) -> usize {
        self.active() + self.resolved
    }
}

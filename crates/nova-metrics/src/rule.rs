use crate::error::{ConfigError, QueryError};
use crate::matcher::SeriesMatcher;
use crate::query::Aggregation;
use crate::sample::SeriesKey;
use crate::store::SeriesStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// 告警级别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = ">=", alias = "gte")]
    GreaterEqual,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
    #[serde(rename = "<=", alias = "lte")]
    LessEqual,
    #[serde(rename = "==", alias = "eq")]
    Equal,
}

impl Comparator {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > threshold,
            Comparator::GreaterEqual => value >= threshold,
            Comparator::LessThan => value < threshold,
            Comparator::LessEqual => value <= threshold,
            Comparator::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparator::GreaterThan => ">",
            Comparator::GreaterEqual => ">=",
            Comparator::LessThan => "<",
            Comparator::LessEqual => "<=",
            Comparator::Equal => "==",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    #[default]
    Threshold,
    #[serde(alias = "rate_of_change")]
    Rate,
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

/// 规则定义（配置形式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub selector: String,
    #[serde(default)]
    pub condition: ConditionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(default, with = "humantime_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl RuleDefinition {
    pub fn threshold(
        id: impl Into<String>,
        selector: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
    ) -> Self {
        Self {
            id: id.into(),
            selector: selector.into(),
            condition: ConditionKind::Threshold,
            aggregation: None,
            window: default_window(),
            comparator,
            threshold,
            duration: Duration::ZERO,
            severity: Severity::default(),
            summary: None,
        }
    }

    pub fn rate(
        id: impl Into<String>,
        selector: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
    ) -> Self {
        Self {
            condition: ConditionKind::Rate,
            ..Self::threshold(id, selector, comparator, threshold)
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// 编译为可评估的规则：选择器只在这里解析一次
    pub fn compile(&self) -> Result<Rule, ConfigError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ConfigError::rule("<empty>", "rule id must not be empty"));
        }
        if !self.threshold.is_finite() {
            return Err(ConfigError::rule(id, "threshold must be a finite number"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::rule(id, "window must be greater than 0"));
        }

        let matcher = SeriesMatcher::parse(&self.selector)?;

        let condition = match self.condition {
            ConditionKind::Threshold => {
                let aggregation = self.aggregation.unwrap_or(Aggregation::Latest);
                aggregation
                    .validate()
                    .map_err(|e| ConfigError::rule(id, e.to_string()))?;
                Condition::Threshold {
                    aggregation,
                    window: self.window,
                }
            }
            ConditionKind::Rate => match self.aggregation {
                None | Some(Aggregation::Rate) => Condition::RateOfChange {
                    window: self.window,
                },
                Some(other) => {
                    return Err(ConfigError::rule(
                        id,
                        format!("rate condition does not take aggregation {other}"),
                    ))
                }
            },
        };

        Ok(Rule {
            id: id.to_string(),
            matcher,
            condition,
            comparator: self.comparator,
            threshold: self.threshold,
            duration: self.duration,
            severity: self.severity,
            summary: self.summary.clone(),
        })
    }
}

/// 规则条件
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    Threshold {
        aggregation: Aggregation,
        window: Duration,
    },
    /// 窗口内每秒变化量
    RateOfChange { window: Duration },
}

/// 编译后的规则，注册后不可变
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    matcher: SeriesMatcher,
    condition: Condition,
    comparator: Comparator,
    threshold: f64,
    duration: Duration,
    severity: Severity,
    summary: Option<String>,
}

impl Rule {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn matcher(&self) -> &SeriesMatcher {
        &self.matcher
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// 条件值，查询失败时由调用方按条件不成立处理
    pub fn value(&self, store: &SeriesStore, key: &SeriesKey) -> Result<f64, QueryError> {
        match self.condition {
            Condition::Threshold {
                aggregation,
                window,
            } => store.query(key, aggregation, Some(window)),
            Condition::RateOfChange { window } => store.query(key, Aggregation::Rate, Some(window)),
        }
    }

    pub fn breached(&self, value: f64) -> bool {
        self.comparator.check(value, self.threshold)
    }

    pub fn message(&self, key: &SeriesKey, value: f64) -> String {
        let subject = match self.condition {
            Condition::Threshold { aggregation, .. } => format!("{aggregation}({key})"),
            Condition::RateOfChange { .. } => format!("rate({key})"),
        };
        match &self.summary {
            Some(summary) => format!(
                "{summary}: {subject} = {value:.2} {} {:.2}",
                self.comparator, self.threshold
            ),
            None => format!(
                "{}: {subject} = {value:.2} {} {:.2}",
                self.id, self.comparator, self.threshold
            ),
        }
    }
}

/// 编译全部规则，拒绝重复 id
pub fn compile_rules(definitions: &[RuleDefinition]) -> Result<Vec<Rule>, ConfigError> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let rule = definition.compile()?;
        if !seen.insert(rule.id.clone()) {
            return Err(ConfigError::DuplicateRuleId(rule.id));
        }
        rules.push(rule);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparators() {
        assert!(Comparator::GreaterThan.check(11.0, 10.0));
        assert!(!Comparator::GreaterThan.check(10.0, 10.0));
        assert!(Comparator::GreaterEqual.check(10.0, 10.0));
        assert!(Comparator::LessThan.check(9.0, 10.0));
        assert!(Comparator::LessEqual.check(10.0, 10.0));
        assert!(Comparator::Equal.check(0.1 + 0.2 - 0.2, 0.1));
        assert!(!Comparator::Equal.check(0.2, 0.1));
    }

    #[test]
    fn test_compile_defaults_to_latest() {
        let rule = RuleDefinition::threshold("cpu-high", "cpu.*{host=web-*}", Comparator::GreaterThan, 90.0)
            .compile()
            .unwrap();
        assert_eq!(rule.id(), "cpu-high");
        assert_eq!(
            rule.condition(),
            Condition::Threshold {
                aggregation: Aggregation::Latest,
                window: Duration::from_secs(60),
            }
        );
        assert_eq!(rule.severity(), Severity::Warning);
        assert!(rule.breached(91.0));
    }

    #[test]
    fn test_compile_rejects_malformed_rules() {
        let empty_id = RuleDefinition::threshold(" ", "cpu", Comparator::GreaterThan, 1.0);
        assert!(matches!(empty_id.compile(), Err(ConfigError::MalformedRule { .. })));

        let bad_selector = RuleDefinition::threshold("r", "cpu{host", Comparator::GreaterThan, 1.0);
        assert!(matches!(bad_selector.compile(), Err(ConfigError::MalformedSelector { .. })));

        let nan = RuleDefinition::threshold("r", "cpu", Comparator::GreaterThan, f64::NAN);
        assert!(nan.compile().is_err());

        let bad_percentile = RuleDefinition::threshold("r", "cpu", Comparator::GreaterThan, 1.0)
            .with_aggregation(Aggregation::Percentile(120.0));
        assert!(matches!(bad_percentile.compile(), Err(ConfigError::MalformedRule { .. })));

        let rate_with_mean = RuleDefinition::rate("r", "cpu", Comparator::GreaterThan, 1.0)
            .with_aggregation(Aggregation::Mean);
        assert!(rate_with_mean.compile().is_err());

        let zero_window = RuleDefinition::threshold("r", "cpu", Comparator::GreaterThan, 1.0)
            .with_window(Duration::ZERO);
        assert!(zero_window.compile().is_err());
    }

    #[test]
    fn test_duplicate_rule_ids() {
        let defs = vec![
            RuleDefinition::threshold("dup", "cpu", Comparator::GreaterThan, 1.0),
            RuleDefinition::threshold("dup", "mem", Comparator::LessThan, 1.0),
        ];
        assert_eq!(
            compile_rules(&defs).unwrap_err(),
            ConfigError::DuplicateRuleId("dup".to_string())
        );
    }

    #[test]
    fn test_definition_from_json() {
        let def: RuleDefinition = serde_json::from_str(
            r#"{
                "id": "latency-p95",
                "selector": "http.latency{service=api}",
                "aggregation": "p95",
                "window": "5m",
                "comparator": ">=",
                "threshold": 250.0,
                "duration": "30s",
                "severity": "critical"
            }"#,
        )
        .unwrap();

        assert_eq!(def.condition, ConditionKind::Threshold);
        assert_eq!(def.aggregation, Some(Aggregation::Percentile(95.0)));
        assert_eq!(def.window, Duration::from_secs(300));
        assert_eq!(def.duration, Duration::from_secs(30));
        assert_eq!(def.comparator, Comparator::GreaterEqual);
        assert_eq!(def.severity, Severity::Critical);
    }

    #[test]
    fn test_comparator_aliases() {
        let cmp: Comparator = serde_json::from_str("\"gt\"").unwrap();
        assert_eq!(cmp, Comparator::GreaterThan);
        assert_eq!(Comparator::LessEqual.to_string(), "<=");
    }

    #[test]
    fn test_message_uses_summary() {
        let rule = RuleDefinition::threshold("disk", "disk.used", Comparator::GreaterThan, 80.0)
            .with_summary("Disk almost full")
            .compile()
            .unwrap();
        let message = rule.message(&SeriesKey::new("disk.used").with_tag("host", "a"), 91.5);
        assert_eq!(message, "Disk almost full: latest(disk.used{host=a}) = 91.50 > 80.00");
    }
}

use thiserror::Error;

/// 样本写入错误
///
/// 调用方只得到一个结果，样本被丢弃并计数，不会作为故障向上传播。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Invalid value for metric {metric}: {value}")]
    InvalidValue { metric: String, value: f64 },

    #[error("Timestamp of metric {metric} is {ahead_ms}ms ahead of the ingest clock")]
    ClockSkew { metric: String, ahead_ms: i64 },

    #[error("Metric name is empty")]
    EmptyMetricName,
}

/// 序列查询错误，规则评估时一律按条件不成立处理
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum QueryError {
    #[error("Not enough samples in the query window")]
    Insufficient,

    #[error("Unknown series")]
    UnknownSeries,

    #[error("Percentile out of range: {0}")]
    InvalidPercentile(f64),
}

/// 配置错误，只在启动阶段出现
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Malformed rule {rule_id}: {reason}")]
    MalformedRule { rule_id: String, reason: String },

    #[error("Duplicate rule id: {0}")]
    DuplicateRuleId(String),

    #[error("Malformed selector {selector:?}: {reason}")]
    MalformedSelector { selector: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn rule(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::MalformedRule {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    pub fn selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::MalformedSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// 单条规则评估失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Rule {rule_id} produced a non-finite value {value} for {series}")]
    NonFiniteValue {
        rule_id: String,
        series: String,
        value: f64,
    },
}

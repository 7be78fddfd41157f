use crate::error::QueryError;
use crate::sample::SamplePoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 聚合类型
///
/// 配置里写作 `latest`、`mean`、`sum`、`count`、`min`、`max`、`rate`、`p95`。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Aggregation {
    Latest,
    Mean,
    Sum,
    Count,
    Min,
    Max,
    /// 窗口内首尾值之差除以经过的秒数
    Rate,
    /// 最近秩百分位
    Percentile(f64),
}

impl Aggregation {
    /// 对按时间升序排列的窗口求值
    pub fn apply(&self, points: &[SamplePoint]) -> Result<f64, QueryError> {
        if let Aggregation::Percentile(p) = self {
            if !(0.0..=100.0).contains(p) {
                return Err(QueryError::InvalidPercentile(*p));
            }
        }

        let (first, last) = match (points.first(), points.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(QueryError::Insufficient),
        };

        let value = match self {
            Aggregation::Latest => last.value,
            Aggregation::Mean => points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64,
            Aggregation::Sum => points.iter().map(|p| p.value).sum(),
            Aggregation::Count => points.len() as f64,
            Aggregation::Min => points.iter().map(|p| p.value).fold(f64::INFINITY, f64::min),
            Aggregation::Max => points
                .iter()
                .map(|p| p.value)
                .fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Rate => {
                if points.len() < 2 {
                    return Err(QueryError::Insufficient);
                }
                let elapsed_ms = (last.timestamp - first.timestamp).num_milliseconds();
                if elapsed_ms <= 0 {
                    return Err(QueryError::Insufficient);
                }
                (last.value - first.value) / (elapsed_ms as f64 / 1000.0)
            }
            Aggregation::Percentile(p) => nearest_rank(points, *p),
        };

        Ok(value)
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        match self {
            Aggregation::Percentile(p) if !(0.0..=100.0).contains(p) => {
                Err(QueryError::InvalidPercentile(*p))
            }
            _ => Ok(()),
        }
    }
}

fn nearest_rank(points: &[SamplePoint], p: f64) -> f64 {
    let mut sorted: Vec<f64> = points.iter().map(|point| point.value).collect();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "latest" | "last" => Ok(Self::Latest),
            "mean" | "avg" => Ok(Self::Mean),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "rate" => Ok(Self::Rate),
            other => {
                let raw = other
                    .strip_prefix("percentile(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| other.strip_prefix('p'))
                    .ok_or_else(|| format!("unknown aggregation: {s}"))?;
                let p: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile in aggregation: {s}"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile must be within 0..=100: {s}"));
                }
                Ok(Self::Percentile(p))
            }
        }
    }
}

impl TryFrom<String> for Aggregation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Aggregation> for String {
    fn from(value: Aggregation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Mean => f.write_str("mean"),
            Self::Sum => f.write_str("sum"),
            Self::Count => f.write_str("count"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Rate => f.write_str("rate"),
            Self::Percentile(p) => write!(f, "p{p}"),
        }
    }
}

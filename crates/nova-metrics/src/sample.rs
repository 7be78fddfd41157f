use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 指标样本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric_name: String,
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            timestamp: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            metric: self.metric_name.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn point(&self) -> SamplePoint {
        SamplePoint {
            timestamp: self.timestamp,
            value: self.value,
        }
    }
}

/// 序列标识：指标名 + 标签集合
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl SeriesKey {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

/// 序列内保存的数据点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl SamplePoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_display() {
        let key = SeriesKey::new("cpu.usage")
            .with_tag("host", "web-01")
            .with_tag("env", "prod");
        assert_eq!(key.to_string(), "cpu.usage{env=prod,host=web-01}");
        assert_eq!(SeriesKey::new("uptime").to_string(), "uptime");
    }

    #[test]
    fn test_sample_key_ignores_tag_order() {
        let a = Sample::new("mem", 1.0).with_tag("a", "1").with_tag("b", "2");
        let b = Sample::new("mem", 2.0).with_tag("b", "2").with_tag("a", "1");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_sample_deserialize_defaults() {
        let sample: Sample =
            serde_json::from_str(r#"{"metric_name":"disk.used","value":0.5}"#).unwrap();
        assert!(sample.tags.is_empty());
        assert_eq!(sample.value, 0.5);
    }
}

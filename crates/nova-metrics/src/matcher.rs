use crate::error::ConfigError;
use crate::sample::SeriesKey;
use std::fmt;
use std::str::FromStr;

/// 单个匹配模式：精确、`*`、或 `prefix*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty pattern".to_string());
        }
        if raw == "*" {
            return Ok(Pattern::Any);
        }
        match raw.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => {
                Err(format!("wildcard is only allowed as a suffix: {raw}"))
            }
            Some(prefix) => Ok(Pattern::Prefix(prefix.to_string())),
            None if raw.contains('*') => Err(format!("wildcard is only allowed as a suffix: {raw}")),
            None => Ok(Pattern::Exact(raw.to_string())),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(exact) => exact == value,
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Exact(exact) => f.write_str(exact),
            Pattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// 编译后的序列选择器
///
/// 语法：`metric_pattern{key=pattern,...}`，标签部分可省略。
/// 每个列出的标签都必须存在且匹配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMatcher {
    source: String,
    metric: Pattern,
    tags: Vec<(String, Pattern)>,
}

impl SeriesMatcher {
    pub fn parse(selector: &str) -> Result<Self, ConfigError> {
        let source = selector.trim();
        let (metric_part, tag_part) = match source.find('{') {
            Some(open) => {
                let inner = source[open + 1..]
                    .strip_suffix('}')
                    .ok_or_else(|| ConfigError::selector(source, "missing closing '}'"))?;
                (&source[..open], Some(inner))
            }
            None if source.contains('}') => {
                return Err(ConfigError::selector(source, "unexpected '}'"));
            }
            None => (source, None),
        };

        let metric =
            Pattern::parse(metric_part).map_err(|reason| ConfigError::selector(source, reason))?;

        let mut tags: Vec<(String, Pattern)> = Vec::new();
        for entry in tag_part.into_iter().flat_map(|inner| inner.split(',')) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::selector(source, format!("expected key=pattern, got {entry:?}")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::selector(source, "empty tag key"));
            }
            if tags.iter().any(|(existing, _)| existing == key) {
                return Err(ConfigError::selector(source, format!("duplicate tag key {key:?}")));
            }
            let pattern =
                Pattern::parse(value).map_err(|reason| ConfigError::selector(source, reason))?;
            tags.push((key.to_string(), pattern));
        }

        Ok(Self {
            source: source.to_string(),
            metric,
            tags,
        })
    }

    pub fn matches(&self, key: &SeriesKey) -> bool {
        self.metric.matches(&key.metric)
            && self.tags.iter().all(|(tag, pattern)| {
                key.tags
                    .get(tag)
                    .is_some_and(|value| pattern.matches(value))
            })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for SeriesMatcher {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SeriesMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(metric: &str, tags: &[(&str, &str)]) -> SeriesKey {
        tags.iter()
            .fold(SeriesKey::new(metric), |k, (t, v)| k.with_tag(*t, *v))
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!(Pattern::parse("*").unwrap(), Pattern::Any);
        assert_eq!(Pattern::parse("cpu.*").unwrap(), Pattern::Prefix("cpu.".into()));
        assert_eq!(Pattern::parse(" cpu ").unwrap(), Pattern::Exact("cpu".into()));
        assert!(Pattern::parse("c*u").is_err());
        assert!(Pattern::parse("**").is_err());
        assert!(Pattern::parse("").is_err());
    }

    #[test]
    fn test_exact_metric_selector() {
        let matcher = SeriesMatcher::parse("cpu.usage").unwrap();
        assert!(matcher.matches(&key("cpu.usage", &[("host", "a")])));
        assert!(!matcher.matches(&key("cpu.usage.max", &[])));
    }

    #[test]
    fn test_wildcard_suffix_with_tags() {
        let matcher = SeriesMatcher::parse("cpu.*{host=web-*,env=prod}").unwrap();
        assert!(matcher.matches(&key("cpu.user", &[("host", "web-01"), ("env", "prod")])));
        assert!(!matcher.matches(&key("cpu.user", &[("host", "db-01"), ("env", "prod")])));
        // 缺少标签时不匹配
        assert!(!matcher.matches(&key("cpu.user", &[("host", "web-01")])));
        assert!(!matcher.matches(&key("mem.used", &[("host", "web-01"), ("env", "prod")])));
    }

    #[test]
    fn test_malformed_selectors() {
        assert!(SeriesMatcher::parse("cpu{host=a").is_err());
        assert!(SeriesMatcher::parse("cpu}").is_err());
        assert!(SeriesMatcher::parse("cpu{host}").is_err());
        assert!(SeriesMatcher::parse("cpu{=a}").is_err());
        assert!(SeriesMatcher::parse("cpu{a=1,a=2}").is_err());
        assert!(SeriesMatcher::parse("{a=1}").is_err());
    }

    #[test]
    fn test_any_metric_with_empty_tag_block() {
        let matcher: SeriesMatcher = "*{}".parse().unwrap();
        assert!(matcher.matches(&key("anything", &[])));
        assert_eq!(matcher.as_str(), "*{}");
    }
}

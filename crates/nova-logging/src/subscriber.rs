use crate::config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter {directives:?}: {reason}")]
    InvalidFilter { directives: String, reason: String },

    #[error("Global subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// 构造过滤器；`RUST_LOG` 非空时优先于配置
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_from(from_env.as_deref(), &config.level)
}

fn filter_from(env_directives: Option<&str>, configured: &str) -> Result<EnvFilter, LoggingError> {
    let directives = match env_directives {
        Some(directives) if !directives.trim().is_empty() => directives,
        _ => configured,
    };

    EnvFilter::try_new(directives).map_err(|e| LoggingError::InvalidFilter {
        directives: directives.to_string(),
        reason: e.to_string(),
    })
}

/// 校验配置中的过滤指令
pub fn validate(config: &LoggingConfig) -> Result<(), LoggingError> {
    filter_from(None, &config.level).map(|_| ())
}

/// 安装全局 tracing 订阅者
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

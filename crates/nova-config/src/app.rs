use nova_logging::LoggingConfig;
use nova_metrics::{
    compile_rules, ConfigError, EvaluatorConfig, IngestConfig, MonitorConfig, NotifierConfig,
    Pattern, RegistryConfig, Rule, RuleDefinition, SeriesConfig,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// HTTP 服务配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 关闭时等待后台任务结束的时长
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::invalid(format!("server.host is not an IP address: {}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub series: SeriesConfig,
    pub evaluator: EvaluatorConfig,
    pub alerts: RegistryConfig,
    pub rules: Vec<RuleDefinition>,
    pub notifiers: Vec<NotifierConfig>,
}

impl AppConfig {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            ingest: self.ingest.clone(),
            series: self.series.clone(),
            evaluator: self.evaluator.clone(),
            alerts: self.alerts.clone(),
        }
    }

    pub fn compile_rules(&self) -> Result<Vec<Rule>, ConfigError> {
        compile_rules(&self.rules)
    }

    /// 启动前校验，任何错误都是致命的
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        nova_logging::validate(&self.logging).map_err(|e| ConfigError::invalid(e.to_string()))?;

        if self.series.default_capacity == 0 {
            return Err(ConfigError::invalid("series.default_capacity must be greater than 0"));
        }
        if self.series.max_series == 0 {
            return Err(ConfigError::invalid("series.max_series must be greater than 0"));
        }
        for class in &self.series.capacity_classes {
            Pattern::parse(&class.pattern).map_err(|reason| ConfigError::selector(&class.pattern, reason))?;
            if class.capacity == 0 {
                return Err(ConfigError::invalid(format!(
                    "capacity class {} must have a capacity greater than 0",
                    class.pattern
                )));
            }
        }

        if self.evaluator.period.is_zero() {
            return Err(ConfigError::invalid("evaluator.period must be greater than 0"));
        }
        if self.evaluator.maintenance_interval.is_zero() {
            return Err(ConfigError::invalid(
                "evaluator.maintenance_interval must be greater than 0",
            ));
        }
        if self.alerts.history_capacity == 0 {
            return Err(ConfigError::invalid("alerts.history_capacity must be greater than 0"));
        }

        self.compile_rules()?;

        for notifier in &self.notifiers {
            notifier
                .validate()
                .map_err(|e| ConfigError::invalid(e.to_string()))?;
        }

        Ok(())
    }

    /// 序列化为 TOML，用于输出当前生效的配置
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

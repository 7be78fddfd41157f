use crate::alert::{AlertEvent, AlertEventKind};
use async_trait::async_trait;
use nova_shutdown::ShutdownListener;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

/// 通知渠道接口
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError>;
    fn name(&self) -> &str;
}

/// 通知错误
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Webhook returned status {0}")]
    UnexpectedStatus(u16),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// 通知渠道配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(5)
}

impl NotifierConfig {
    pub fn validate(&self) -> Result<(), NotifierError> {
        match self {
            NotifierConfig::Log => Ok(()),
            NotifierConfig::Webhook { url, .. } if url.trim().is_empty() => Err(
                NotifierError::ConfigError("webhook notifier requires a url".to_string()),
            ),
            NotifierConfig::Webhook { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Err(NotifierError::ConfigError(format!(
                    "webhook url must be http(s): {url}"
                )))
            }
            NotifierConfig::Webhook { .. } => Ok(()),
        }
    }
}

/// 写入日志的通知器
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError> {
        let alert = &event.alert;
        match event.kind {
            AlertEventKind::Resolved => info!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                series = %alert.series_identity,
                reason = ?alert.resolve_reason,
                "[ALERT RESOLVED] {}",
                alert.message
            ),
            _ => warn!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                series = %alert.series_identity,
                severity = %alert.severity,
                state = ?alert.state,
                "[ALERT] {}",
                alert.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Webhook 通知器，以 JSON POST 事件
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self, NotifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifierError::ConfigError(e.to_string()))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifierError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifierError::UnexpectedStatus(response.status().as_u16()));
        }

        info!(url = %self.url, alert_id = %event.alert.id, "Webhook notification sent");
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// 通知管理器
pub struct NotificationManager {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            notifiers: Vec::new(),
        }
    }

    pub fn from_config(configs: &[NotifierConfig]) -> Result<Self, NotifierError> {
        let mut manager = Self::new();
        for config in configs {
            config.validate()?;
            let notifier: Box<dyn Notifier> = match config {
                NotifierConfig::Log => Box::new(LogNotifier),
                NotifierConfig::Webhook { url, timeout } => {
                    Box::new(WebhookNotifier::new(url.clone(), *timeout)?)
                }
            };
            manager.add_notifier(notifier);
        }
        Ok(manager)
    }

    pub fn add_notifier(&mut self, notifier: Box<dyn Notifier>) {
        info!("Adding notifier: {}", notifier.name());
        self.notifiers.push(notifier);
    }

    /// Pending 事件不通知
    pub async fn notify(&self, event: &AlertEvent) {
        if event.kind == AlertEventKind::Pending {
            return;
        }
        for notifier in &self.notifiers {
            if let Err(e) = notifier.send(event).await {
                error!("Failed to send notification via {}: {}", notifier.name(), e);
            }
        }
    }

    pub fn notifier_count(&self) -> usize {
        self.notifiers.len()
    }

    /// 消费告警事件，直到关闭或事件通道关闭
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<AlertEvent>,
        mut shutdown: ShutdownListener,
    ) {
        info!(notifiers = self.notifiers.len(), "Notification dispatcher started");
        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => self.notify(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification dispatcher lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Notification dispatcher stopped");
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

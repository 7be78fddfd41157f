use crate::signal::{ShutdownListener, SignalHandler};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// 排空结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// 所有任务自行退出
    Complete,
    /// 有任务超时被中止
    Aborted { tasks: usize },
}

/// 关闭协调器
///
/// 持有后台任务句柄；收到信号后在 `drain_timeout` 内等待它们自行退出，超时则中止。
pub struct ShutdownCoordinator {
    signal_handler: SignalHandler,
    listener: ShutdownListener,
    tasks: Vec<(String, JoinHandle<()>)>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn builder() -> ShutdownCoordinatorBuilder {
        ShutdownCoordinatorBuilder::new()
    }

    /// 获取信号处理器的引用
    pub fn signal_handler(&self) -> &SignalHandler {
        &self.signal_handler
    }

    pub fn subscribe(&self) -> ShutdownListener {
        self.signal_handler.subscribe()
    }

    /// 登记需要在关闭时等待的任务
    pub fn track(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.push((name.into(), handle));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// 等待关闭信号（系统信号或手动触发）后排空任务
    pub async fn run(self) -> ShutdownPhase {
        info!("Shutdown coordinator started, waiting for signal...");

        let mut listener = self.listener.clone();
        tokio::select! {
            received = listener.wait() => {
                info!("Received shutdown signal: {:?}", received);
            }
            received = self.signal_handler.wait_for_system_signal() => {
                if let Err(e) = received {
                    warn!("Failed to listen for system signals: {}", e);
                    self.signal_handler.trigger_shutdown();
                }
            }
        }

        self.drain().await
    }

    /// 触发后直接排空，不等待系统信号
    pub async fn shutdown_now(self) -> ShutdownPhase {
        self.signal_handler.trigger_shutdown();
        self.drain().await
    }

    async fn drain(self) -> ShutdownPhase {
        let start = std::time::Instant::now();
        info!(tasks = self.tasks.len(), "Draining background tasks...");

        let mut aborted = 0;
        for (name, mut handle) in self.tasks {
            match timeout(self.drain_timeout, &mut handle).await {
                Ok(Ok(())) => info!(task = %name, "Task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, "Task drain timed out after {:?}, aborting", self.drain_timeout);
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        info!("Graceful shutdown complete in {:?}", start.elapsed());
        if aborted == 0 {
            ShutdownPhase::Complete
        } else {
            ShutdownPhase::Aborted { tasks: aborted }
        }
    }
}

/// 关闭协调器构建器
pub struct ShutdownCoordinatorBuilder {
    signal_handler: Option<(SignalHandler, ShutdownListener)>,
    drain_timeout: Duration,
}

impl ShutdownCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            signal_handler: None,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_signal_handler(mut self, handler: SignalHandler) -> Self {
        let listener = handler.subscribe();
        self.signal_handler = Some((handler, listener));
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> ShutdownCoordinator {
        let (signal_handler, listener) = self.signal_handler.unwrap_or_else(SignalHandler::new);

        ShutdownCoordinator {
            signal_handler,
            listener,
            tasks: Vec::new(),
            drain_timeout: self.drain_timeout,
        }
    }
}

impl Default for ShutdownCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

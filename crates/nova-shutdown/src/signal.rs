use std::io;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM - 优雅关闭
    Term,

    /// SIGINT - Ctrl+C
    Interrupt,

    /// 手动触发
    Manual,
}

/// 信号处理器
///
/// 关闭状态保存在 watch 通道里，后订阅的监听者也能立即看到已经发生的关闭。
pub struct SignalHandler {
    shutdown_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl SignalHandler {
    pub fn new() -> (Self, ShutdownListener) {
        let (tx, rx) = watch::channel(None);
        let listener = ShutdownListener { rx, _idle_tx: None };
        (Self { shutdown_tx: tx }, listener)
    }

    /// 等待系统信号并广播给所有监听者
    #[cfg(unix)]
    pub async fn wait_for_system_signal(&self) -> io::Result<ShutdownSignal> {
        use signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let received = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                ShutdownSignal::Term
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                ShutdownSignal::Interrupt
            }
        };

        self.trigger(received);
        Ok(received)
    }

    /// 等待系统信号（Windows 版本）
    #[cfg(not(unix))]
    pub async fn wait_for_system_signal(&self) -> io::Result<ShutdownSignal> {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        self.trigger(ShutdownSignal::Interrupt);
        Ok(ShutdownSignal::Interrupt)
    }

    /// 手动触发关闭
    pub fn trigger_shutdown(&self) {
        info!("Manual shutdown triggered");
        self.trigger(ShutdownSignal::Manual);
    }

    fn trigger(&self, received: ShutdownSignal) {
        // 只记录第一次收到的信号
        self.shutdown_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(received);
                true
            } else {
                false
            }
        });
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.shutdown_tx.subscribe(),
            _idle_tx: None,
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new().0
    }
}

/// 关闭监听者
///
/// `is_shutdown` 不阻塞，供周期任务在工作单元之间检查；`wait` 用于 select。
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<Option<ShutdownSignal>>,
    // 仅 never() 持有，保证 changed() 一直挂起
    _idle_tx: Option<Arc<watch::Sender<Option<ShutdownSignal>>>>,
}

impl ShutdownListener {
    /// 永不触发的监听者，用于测试或一次性调用
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            _idle_tx: Some(Arc::new(tx)),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.rx.borrow()
    }

    /// 等待关闭；发送端被丢弃也视为关闭
    pub async fn wait(&mut self) -> Option<ShutdownSignal> {
        loop {
            if let Some(received) = *self.rx.borrow_and_update() {
                return Some(received);
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

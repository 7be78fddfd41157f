pub mod api;
pub mod system;
pub mod telemetry;

use nova_metrics::Monitor;
use std::sync::Arc;
use std::time::Instant;

pub use system::{SystemInfo, SystemSampler};
pub use telemetry::Telemetry;

pub const SERVICE_NAME: &str = "nova-server";

// 定义 AppState（供 main.rs 和测试使用）
pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub telemetry: Telemetry,
    pub system: SystemSampler,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            monitor,
            telemetry: Telemetry::new()?,
            system: SystemSampler::new(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

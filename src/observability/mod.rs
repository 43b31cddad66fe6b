//! 可观测性：日志初始化与执行遥测

pub mod telemetry;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use telemetry::{TelemetryRecord, TelemetryRecorder, TelemetrySummary, DEFAULT_TELEMETRY_CAPACITY};

/// 安装 tracing 订阅者：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

//! Capflow - 能力路由的模式编排内核
//!
//! 模块划分：
//! - **capabilities**: 能力 trait、按名注册与分发（catch-all，失败即数据）、内置能力
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类
//! - **flags**: 确定性的百分比灰度开关
//! - **observability**: 日志初始化与执行遥测（有界缓冲 + 精确聚合）
//! - **pattern**: 模式类型、步骤执行、输出解析、递归守卫运行器、流式执行
//! - **persistence**: 运行结束后的审计存储钩子（内存 / SQLite）

pub mod capabilities;
pub mod config;
pub mod core;
pub mod flags;
pub mod observability;
pub mod pattern;
pub mod persistence;

pub use capabilities::{Capability, CapabilityContext, CapabilityRegistry};
pub use flags::FeatureFlagGate;
pub use observability::TelemetryRecorder;
pub use pattern::{PatternDefinition, PatternResult, PatternRunner, PatternStore};

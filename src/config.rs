//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CAPFLOW__*` 覆盖（双下划线表示嵌套，如 `CAPFLOW__TELEMETRY__CAPACITY=500`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub flags: FlagsSection,
    #[serde(default)]
    pub audit: AuditSection,
}

/// [orchestrator] 段：递归上限、meta / recovery 模式、模式目录
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// 统一路由入口模式 id；为空表示不经 meta
    #[serde(default = "default_meta_pattern")]
    pub meta_pattern: Option<String>,
    #[serde(default = "default_recovery_pattern")]
    pub recovery_pattern: Option<String>,
    #[serde(default = "default_patterns_dir")]
    pub patterns_dir: PathBuf,
    /// 整次运行超时（秒），0 表示不限；内核不做超时控制，仅由宿主（capflow 二进制）施加
    #[serde(default)]
    pub run_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            meta_pattern: default_meta_pattern(),
            recovery_pattern: default_recovery_pattern(),
            patterns_dir: default_patterns_dir(),
            run_timeout_secs: 0,
        }
    }
}

fn default_max_recursion_depth() -> usize {
    6
}

fn default_meta_pattern() -> Option<String> {
    Some("meta".to_string())
}

fn default_recovery_pattern() -> Option<String> {
    Some("recovery".to_string())
}

fn default_patterns_dir() -> PathBuf {
    PathBuf::from("patterns")
}

/// [telemetry] 段：原始记录环形缓冲容量
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_capacity")]
    pub capacity: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            capacity: default_telemetry_capacity(),
        }
    }
}

fn default_telemetry_capacity() -> usize {
    1000
}

/// [flags] 段：开关配置文件与重读间隔
#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    #[serde(default = "default_flags_path")]
    pub path: PathBuf,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

impl Default for FlagsSection {
    fn default() -> Self {
        Self {
            path: default_flags_path(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl FlagsSection {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

fn default_flags_path() -> PathBuf {
    PathBuf::from("config/feature_flags.json")
}

fn default_reload_interval_secs() -> u64 {
    60
}

/// [audit] 段：SQLite 审计库路径，未设置时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditSection {
    pub sqlite_path: Option<PathBuf>,
}

/// 默认配置文件，相对工作目录；缺失时全部使用内置默认值
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// 分层加载：DEFAULT_CONFIG_PATH → config_path → 环境变量 `CAPFLOW__*`，后者覆盖前者。
/// 两个文件都可以不存在
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::from(Path::new(DEFAULT_CONFIG_PATH)).required(false));
    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder
        .add_source(
            config::Environment::with_prefix("CAPFLOW")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

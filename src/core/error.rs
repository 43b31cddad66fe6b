//! 错误类型
//!
//! 能力失败一律转为数据（CapabilityError）在步骤内消化；RunnerError 只描述整个模式运行的失败原因，
//! 最终也会被折叠进 PatternResult 信封，不会以 Err 的形式抛给调用方。

use serde::Serialize;
use thiserror::Error;

/// 单次能力调用的失败（步骤级，非致命）
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    /// 未注册的能力名；附带已注册名称（已排序），便于排查拼写错误
    #[error("Capability not found: {name}")]
    NotFound { name: String, available: Vec<String> },

    /// 处理函数返回了错误
    #[error("Capability '{capability}' failed in {handler}: {message}")]
    HandlerFailed {
        capability: String,
        handler: String,
        message: String,
    },

    /// 处理函数 panic，已被注册表捕获
    #[error("Capability '{capability}' panicked in {handler}: {message}")]
    Panicked {
        capability: String,
        handler: String,
        message: String,
    },
}

impl CapabilityError {
    /// 出错的能力名
    pub fn capability(&self) -> &str {
        match self {
            CapabilityError::NotFound { name, .. } => name,
            CapabilityError::HandlerFailed { capability, .. }
            | CapabilityError::Panicked { capability, .. } => capability,
        }
    }

    /// 结构化错误值：`{error, capability, handler?, available?}`
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            CapabilityError::NotFound { name, available } => serde_json::json!({
                "error": self.to_string(),
                "capability": name,
                "available": available,
            }),
            CapabilityError::HandlerFailed { capability, handler, .. }
            | CapabilityError::Panicked { capability, handler, .. } => serde_json::json!({
                "error": self.to_string(),
                "capability": capability,
                "handler": handler,
            }),
        }
    }
}

/// 模式运行级错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Max recursion depth {max} exceeded (depth {depth})")]
    MaxRecursionExceeded { depth: usize, max: usize },

    /// 声明了 error_handling = "stop" 的步骤失败
    #[error("Step {index} ({capability}) failed and halted the pattern: {reason}")]
    StepHalted {
        index: usize,
        capability: String,
        reason: String,
    },

    /// 流式消费方提前终止
    #[error("Execution cancelled")]
    Cancelled,
}

/// 灰度开关配置读取失败
#[derive(Error, Debug)]
pub enum FlagError {
    #[error("Feature flag config unreadable: {0}")]
    ConfigLoad(String),

    #[error("Feature flag config malformed: {0}")]
    Parse(String),
}

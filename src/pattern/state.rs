//! 运行状态
//!
//! ExecutionState 由单个 PatternRun 独占，后写覆盖先写；StepOutcome 构成运行轨迹；
//! PatternResult 是每次运行对外返回的信封。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::pattern::outputs::ResolverWarning;

/// 累积状态：键 → 值，后写覆盖
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ExecutionState {
    values: Map<String, Value>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// 合并能力结果：有 save_as 时整体包在该键下，否则平铺合并；返回写入的键
    pub fn merge(&mut self, output: Map<String, Value>, save_as: Option<&str>) -> Vec<String> {
        match save_as {
            Some(key) => {
                self.values.insert(key.to_string(), Value::Object(output));
                vec![key.to_string()]
            }
            None => {
                let keys: Vec<String> = output.keys().cloned().collect();
                self.values.extend(output);
                keys
            }
        }
    }

    /// 当前所有键（排序）
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

impl From<Map<String, Value>> for ExecutionState {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
}

/// 单步执行记录
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub capability: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub produced_keys: Vec<String>,
    pub error: Option<String>,
    /// 结构化错误值（`{error, capability, handler, ...}`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<Value>,
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }
}

/// 单次模式运行：每次调用创建，结束后丢弃，不支持恢复或重试
#[derive(Debug)]
pub struct PatternRun {
    pub pattern_id: String,
    pub inputs: Map<String, Value>,
    pub state: ExecutionState,
    pub depth: usize,
    pub trace: Vec<StepOutcome>,
}

impl PatternRun {
    pub fn new(pattern_id: impl Into<String>, inputs: Map<String, Value>, depth: usize) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            inputs,
            state: ExecutionState::new(),
            depth,
            trace: Vec::new(),
        }
    }

    pub fn failed_steps(&self) -> usize {
        self.trace.iter().filter(|s| !s.is_ok()).count()
    }
}

/// 对外结果信封：显式的 success / error 字段与简短原因
#[derive(Debug, Clone, Serialize)]
pub struct PatternResult {
    pub success: bool,
    pub pattern_id: String,
    /// 按输出声明解析得到的数据
    pub data: Map<String, Value>,
    pub state: ExecutionState,
    pub trace: Vec<StepOutcome>,
    pub warnings: Vec<ResolverWarning>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fallback_mode: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub recovery_attempted: bool,
    pub duration_ms: u64,
}

impl PatternResult {
    /// 失败信封（未执行步骤或执行中止）
    pub fn failure(pattern_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            pattern_id: pattern_id.into(),
            data: Map::new(),
            state: ExecutionState::new(),
            trace: Vec::new(),
            warnings: Vec::new(),
            error: Some(error.into()),
            fallback_mode: false,
            recovery_attempted: false,
            duration_ms: 0,
        }
    }

    /// 是否有步骤失败（success 仍可能为 true：非 stop 步骤的失败不影响整体）
    pub fn has_step_errors(&self) -> bool {
        self.trace.iter().any(|s| !s.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_flat_and_last_write_wins() {
        let mut state = ExecutionState::new();
        state.merge(json!({"a": 1, "b": 2}).as_object().cloned().unwrap(), None);
        let keys = state.merge(json!({"b": 3}).as_object().cloned().unwrap(), None);
        assert_eq!(keys, vec!["b".to_string()]);
        assert_eq!(state.get("b"), Some(&json!(3)));
        assert_eq!(state.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_merge_save_as_wraps_result() {
        let mut state = ExecutionState::new();
        let keys = state.merge(json!({"value": 0.1}).as_object().cloned().unwrap(), Some("twr"));
        assert_eq!(keys, vec!["twr".to_string()]);
        assert_eq!(state.get("twr"), Some(&json!({"value": 0.1})));
        assert!(!state.contains("value"));
    }
}

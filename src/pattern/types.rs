//! 模式类型定义
//!
//! PatternDefinition / StepSpec / OutputSpec 等声明式结构；加载后只读。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type PatternId = String;

/// 调用子模式的保留能力名：params 为 `{pattern_id, inputs?}`
pub const INVOKE_PATTERN_CAPABILITY: &str = "pattern.invoke";

/// 模式定义：有序步骤 + 一个输出声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub id: PatternId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub outputs: OutputSpec,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// 单个步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub description: String,
    /// 带命名空间的能力名，如 `alerts.suggest_presets`
    pub capability: String,
    /// 参数模板：字面量或 `{placeholder}` 引用
    #[serde(default = "empty_object", rename = "args", alias = "params")]
    pub params: Value,
    /// 若设置，整个结果包在该键下，而不是平铺合并进状态
    #[serde(default, rename = "as", alias = "save_as")]
    pub save_as: Option<String>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// 灰度开关：开启时改由 flag.capability 承接本步骤
    #[serde(default)]
    pub flag: Option<FlagRoute>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl StepSpec {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            description: String::new(),
            capability: capability.into(),
            params: empty_object(),
            save_as: None,
            error_handling: ErrorHandling::Continue,
            flag: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = Some(key.into());
        self
    }

    pub fn stop_on_error(mut self) -> Self {
        self.error_handling = ErrorHandling::Stop;
        self
    }

    pub fn flagged(mut self, flag: impl Into<String>, capability: impl Into<String>) -> Self {
        self.flag = Some(FlagRoute {
            name: flag.into(),
            capability: capability.into(),
        });
        self
    }

    pub fn halts_on_error(&self) -> bool {
        self.error_handling == ErrorHandling::Stop
    }
}

/// 步骤失败策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// 记录失败，继续后续步骤
    #[default]
    Continue,
    /// 失败即终止整个模式
    Stop,
}

/// 灰度路由：开关命中时替换能力实现
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRoute {
    pub name: String,
    pub capability: String,
}

/// 面板：按 id 模糊匹配状态键，可选 dataPath 指向嵌套字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    pub id: String,
    #[serde(default, rename = "dataPath", alias = "data_path")]
    pub data_path: Option<String>,
}

/// 输出声明的三种形态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    /// `{"panels": [{id, dataPath}]}`
    Panels { panels: Vec<Panel> },
    /// `["a", "b"]`
    Keys(Vec<String>),
    /// `{"state_key": "说明"}`：键为要导出的状态键，值仅作说明
    Mapping(Map<String, Value>),
}

impl Default for OutputSpec {
    fn default() -> Self {
        OutputSpec::Keys(Vec::new())
    }
}

impl PatternDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<StepSpec>, outputs: OutputSpec) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            description: None,
            steps,
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pattern_json() {
        let raw = json!({
            "id": "portfolio_overview",
            "name": "Portfolio Overview",
            "version": "2.1.0",
            "steps": [
                {"capability": "ledger.positions", "args": {"portfolio_id": "{portfolio_id}"}, "as": "positions"},
                {"capability": "metrics.twr", "error_handling": "stop"}
            ],
            "outputs": {"panels": [{"id": "perf", "dataPath": "twr.value"}]}
        });
        let pattern: PatternDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(pattern.steps.len(), 2);
        assert_eq!(pattern.steps[0].save_as.as_deref(), Some("positions"));
        assert!(pattern.steps[1].halts_on_error());
        match pattern.outputs {
            OutputSpec::Panels { panels } => {
                assert_eq!(panels[0].data_path.as_deref(), Some("twr.value"));
            }
            other => panic!("Expected panels, got {other:?}"),
        }
    }

    #[test]
    fn test_output_spec_forms() {
        let keys: OutputSpec = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert!(matches!(keys, OutputSpec::Keys(ref k) if k.len() == 2));

        let mapping: OutputSpec = serde_json::from_value(json!({"summary": "twr"})).unwrap();
        assert!(matches!(mapping, OutputSpec::Mapping(_)));
    }
}

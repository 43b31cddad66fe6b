//! 内置能力（演示与测试用）

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{Map, Value};

use crate::capabilities::{Capability, CapabilityContext, CapabilityRegistry, TextStream};

/// 流式输出时每段字符数
const CHUNK_CHARS: usize = 6;

/// Echo 能力：回显 `text` 参数
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn description(&self) -> &str {
        "Echo text. Args: {\"text\": \"message\"}"
    }

    async fn execute(&self, params: Value, _ctx: &CapabilityContext) -> anyhow::Result<Map<String, Value>> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        let mut out = Map::new();
        out.insert("text".into(), Value::String(text.to_string()));
        Ok(out)
    }
}

/// 生成式回显：把 `prompt` 按固定字符数切段流式输出
pub struct GenerateTextCapability;

impl GenerateTextCapability {
    fn render(params: &Value) -> String {
        let prompt = params.get("prompt").and_then(|v| v.as_str()).unwrap_or_default();
        format!("Summary: {prompt}")
    }
}

#[async_trait]
impl Capability for GenerateTextCapability {
    fn description(&self) -> &str {
        "Generate text from a prompt (chunked echo). Args: {\"prompt\": \"...\"}"
    }

    async fn execute(&self, params: Value, _ctx: &CapabilityContext) -> anyhow::Result<Map<String, Value>> {
        let mut out = Map::new();
        out.insert("text".into(), Value::String(Self::render(&params)));
        Ok(out)
    }

    async fn execute_stream(&self, params: Value, _ctx: &CapabilityContext) -> anyhow::Result<TextStream> {
        let chars: Vec<char> = Self::render(&params).chars().collect();
        let chunks: Vec<Result<String, String>> = chars
            .chunks(CHUNK_CHARS)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// 注册全部内置能力
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    registry.register("echo", EchoCapability);
    registry.register("text.generate", GenerateTextCapability);
}

//! 能力注册表
//!
//! 所有能力实现 Capability trait，由 CapabilityRegistry 按名（带命名空间，如 `alerts.suggest_presets`）注册与分发。
//! execute 在一个 catch-all 边界内调用处理函数：返回的错误与 panic 都转为 CapabilityError，
//! 注册表保证不会把失败传播给调用方；每次调用输出结构化审计日志（JSON）。

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{stream, FutureExt, Stream, StreamExt};
use serde_json::{Map, Value};

use crate::core::CapabilityError;

/// 能力调用结果：成功时为扁平的 key/value 映射，失败时为结构化错误
pub type CapabilityResult = Result<Map<String, Value>, CapabilityError>;

/// 流式文本输出（生成式步骤逐段产出）
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// 调用能力时附带的上下文
#[derive(Debug, Clone, Default)]
pub struct CapabilityContext {
    /// 当前运行的模式 ID（直接调用时为空）
    pub pattern_id: String,
    /// 当前递归深度
    pub depth: usize,
    /// 调用方传入的输入上下文
    pub inputs: Map<String, Value>,
}

impl CapabilityContext {
    pub fn new(pattern_id: impl Into<String>, depth: usize, inputs: Map<String, Value>) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            depth,
            inputs,
        }
    }
}

/// 能力 trait：描述、处理函数标识、异步执行（params 为 JSON）与可选的流式执行
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力描述
    fn description(&self) -> &str {
        ""
    }

    /// 处理函数标识，出现在 HandlerFailed 错误中；默认是实现类型名
    fn identity(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// 执行能力，返回扁平的结果映射
    async fn execute(&self, params: Value, ctx: &CapabilityContext) -> anyhow::Result<Map<String, Value>>;

    /// 流式执行，返回文本分段；默认把 execute 的结果作为单个分段
    async fn execute_stream(&self, params: Value, ctx: &CapabilityContext) -> anyhow::Result<TextStream> {
        let output = self.execute(params, ctx).await?;
        let text = match output.get("text").and_then(|v| v.as_str()) {
            Some(text) => text.to_string(),
            None => Value::Object(output).to_string(),
        };
        Ok(Box::pin(stream::iter(vec![Ok(text)])))
    }
}

/// 同步闭包适配器：`registry.register_fn("c1", |params| ...)`
pub struct FnCapability<F> {
    name: String,
    func: F,
}

impl<F> FnCapability<F>
where
    F: Fn(Value) -> anyhow::Result<Map<String, Value>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(Value) -> anyhow::Result<Map<String, Value>> + Send + Sync,
{
    fn identity(&self) -> String {
        format!("fn:{}", self.name)
    }

    async fn execute(&self, params: Value, _ctx: &CapabilityContext) -> anyhow::Result<Map<String, Value>> {
        (self.func)(params)
    }
}

/// 能力注册表：按名称存储 Arc<dyn Capability>
///
/// 进程启动时填充，之后只读；稳态运行期间的重新注册没有同步保护，不是受支持的操作。
#[derive(Default)]
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册能力；同名覆盖时记一条 warn，后注册者生效（便于开发期热替换实现）
    pub fn register(&mut self, name: impl Into<String>, handler: impl Capability + 'static) {
        self.register_arc(name, Arc::new(handler));
    }

    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn Capability>) {
        let name = name.into();
        if let Some(previous) = self.handlers.insert(name.clone(), handler) {
            tracing::warn!(
                capability = %name,
                previous = %previous.identity(),
                "Capability re-registered, last registration wins"
            );
        }
    }

    /// 以同步闭包注册能力
    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Value) -> anyhow::Result<Map<String, Value>> + Send + Sync + 'static,
    {
        let name = name.into();
        let handler = FnCapability::new(name.clone(), func);
        self.register(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.handlers.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// 已注册能力名（排序，保证日志与测试可复现）
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// (name, description) 列表，按名称排序
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.list()
            .into_iter()
            .filter_map(|name| {
                let desc = self.handlers.get(&name)?.description().to_string();
                Some((name, desc))
            })
            .collect()
    }

    fn not_found(&self, name: &str) -> CapabilityError {
        CapabilityError::NotFound {
            name: name.to_string(),
            available: self.list(),
        }
    }

    /// 执行指定能力；未注册返回 NotFound，处理函数的错误或 panic 转为 HandlerFailed / Panicked
    pub async fn execute(&self, name: &str, params: Value, ctx: &CapabilityContext) -> CapabilityResult {
        let Some(handler) = self.get(name) else {
            tracing::warn!(capability = %name, "Capability not found");
            return Err(self.not_found(name));
        };

        let start = Instant::now();
        let preview = params_preview(&params);
        let outcome = AssertUnwindSafe(handler.execute(params, ctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CapabilityError::HandlerFailed {
                capability: name.to_string(),
                handler: handler.identity(),
                message: format!("{e:#}"),
            }),
            Err(panic) => Err(CapabilityError::Panicked {
                capability: name.to_string(),
                handler: handler.identity(),
                message: panic_message(panic.as_ref()),
            }),
        };

        audit(name, &result, start, &preview);
        result
    }

    /// 流式执行指定能力；分段中的 panic 会被转换为一个错误分段并结束流
    pub async fn execute_stream(
        &self,
        name: &str,
        params: Value,
        ctx: &CapabilityContext,
    ) -> Result<TextStream, CapabilityError> {
        let Some(handler) = self.get(name) else {
            tracing::warn!(capability = %name, "Capability not found");
            return Err(self.not_found(name));
        };

        let outcome = AssertUnwindSafe(handler.execute_stream(params, ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(chunks)) => {
                let capability = name.to_string();
                let guarded = AssertUnwindSafe(chunks).catch_unwind().map(move |item| match item {
                    Ok(chunk) => chunk,
                    Err(panic) => Err(format!(
                        "Capability '{capability}' panicked while streaming: {}",
                        panic_message(panic.as_ref())
                    )),
                });
                Ok(Box::pin(guarded))
            }
            Ok(Err(e)) => Err(CapabilityError::HandlerFailed {
                capability: name.to_string(),
                handler: handler.identity(),
                message: format!("{e:#}"),
            }),
            Err(panic) => Err(CapabilityError::Panicked {
                capability: name.to_string(),
                handler: handler.identity(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn audit(name: &str, result: &CapabilityResult, start: Instant, preview: &str) {
    let (ok, outcome) = match result {
        Ok(_) => (true, "ok"),
        Err(CapabilityError::Panicked { .. }) => (false, "panic"),
        Err(_) => (false, "error"),
    };
    let audit = serde_json::json!({
        "event": "capability_audit",
        "capability": name,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "params_preview": preview,
    });
    if let Err(e) = result {
        tracing::warn!(audit = %audit, error = %e, "capability");
    } else {
        tracing::info!(audit = %audit, "capability");
    }
}

fn params_preview(params: &Value) -> String {
    let s = params.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_map(key: &str, value: Value) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert(key.to_string(), value);
        m
    }

    #[tokio::test]
    async fn test_execute_registered_capability() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("math.double", |params| {
            let n = params.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(ok_map("doubled", json!(n * 2)))
        });

        let result = registry
            .execute("math.double", json!({"n": 21}), &CapabilityContext::default())
            .await
            .unwrap();
        assert_eq!(result.get("doubled"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_missing_capability_lists_sorted_names() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("zeta.b", |_| Ok(Map::new()));
        registry.register_fn("alpha.a", |_| Ok(Map::new()));

        let err = registry
            .execute("nope", json!({}), &CapabilityContext::default())
            .await
            .unwrap_err();
        match err {
            CapabilityError::NotFound { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, vec!["alpha.a".to_string(), "zeta.b".to_string()]);
            }
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_data() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("c1", |_| anyhow::bail!("upstream quote API down"));

        let err = registry
            .execute("c1", json!({}), &CapabilityContext::default())
            .await
            .unwrap_err();
        let value = err.to_value();
        assert_eq!(value["capability"], json!("c1"));
        assert_eq!(value["handler"], json!("fn:c1"));
        assert!(value["error"].as_str().unwrap().contains("upstream quote API down"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("boom", |_| panic!("division by zero"));

        let err = registry
            .execute("boom", json!({}), &CapabilityContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Panicked { ref message, .. } if message == "division by zero"));
    }

    #[tokio::test]
    async fn test_reregistration_last_wins() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("c", |_| Ok(ok_map("v", json!(1))));
        registry.register_fn("c", |_| Ok(ok_map("v", json!(2))));

        assert_eq!(registry.list(), vec!["c".to_string()]);
        let out = registry
            .execute("c", json!({}), &CapabilityContext::default())
            .await
            .unwrap();
        assert_eq!(out["v"], json!(2));
    }

    #[tokio::test]
    async fn test_default_stream_yields_single_chunk() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("say", |_| Ok(ok_map("text", json!("hello"))));

        let chunks: Vec<_> = registry
            .execute_stream("say", json!({}), &CapabilityContext::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks, vec![Ok("hello".to_string())]);
        assert!(registry.has("say"));
        assert!(!registry.has("other"));
    }

    #[test]
    fn test_descriptions_sorted_by_name() {
        let mut registry = CapabilityRegistry::new();
        crate::capabilities::register_builtins(&mut registry);
        registry.register_fn("alerts.list", |_| Ok(Map::new()));

        let names: Vec<String> = registry.descriptions().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alerts.list", "echo", "text.generate"]);
        let (_, echo) = &registry.descriptions()[1];
        assert!(echo.starts_with("Echo text"));
    }
}

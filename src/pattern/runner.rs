//! 模式运行器
//!
//! 顺序执行步骤；`pattern.invoke` 步骤以 depth + 1 递归运行子模式，深度达到上限时直接返回
//! MaxRecursionExceeded，不执行该层任何步骤。route() 是统一入口：优先经由 meta 模式，
//! meta 不存在或声明无法执行时降级为直接调用单个能力并标记 fallback_mode。
//! 运行中的意外 panic 会尝试 recovery 模式，仍失败则返回终止信封。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};

use crate::capabilities::registry::panic_message;
use crate::capabilities::{CapabilityContext, CapabilityRegistry, CapabilityResult};
use crate::config::OrchestratorSection;
use crate::core::{CapabilityError, RunnerError};
use crate::flags::FeatureFlagGate;
use crate::observability::{TelemetryRecord, TelemetryRecorder};
use crate::pattern::executor::{PreparedStep, StepExecutor};
use crate::pattern::outputs::OutputResolver;
use crate::pattern::state::{PatternResult, PatternRun, StepOutcome};
use crate::pattern::store::PatternStore;
use crate::pattern::stream::{EventSink, PatternEvent};
use crate::pattern::types::{OutputSpec, PatternDefinition, StepSpec, INVOKE_PATTERN_CAPABILITY};
use crate::persistence::AuditStore;

pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 6;
/// meta 模式在状态中写入该键（值为 true）表示没有可用的执行上下文
pub const EXECUTION_UNAVAILABLE_KEY: &str = "execution_unavailable";
const DEFAULT_AGENT_ID: &str = "pattern_runner";

/// 运行器选项
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_depth: usize,
    /// 统一路由入口模式
    pub meta_pattern: Option<String>,
    /// 意外故障时尝试的恢复模式
    pub recovery_pattern: Option<String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_RECURSION_DEPTH,
            meta_pattern: None,
            recovery_pattern: None,
        }
    }
}

impl From<&OrchestratorSection> for RunnerOptions {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            max_depth: section.max_recursion_depth,
            meta_pattern: section.meta_pattern.clone().filter(|s| !s.is_empty()),
            recovery_pattern: section.recovery_pattern.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// 统一入口请求：要执行的能力与参数
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub capability: String,
    pub params: Value,
    pub inputs: Map<String, Value>,
}

impl RouteRequest {
    pub fn new(capability: impl Into<String>, params: Value) -> Self {
        Self {
            capability: capability.into(),
            params,
            inputs: Map::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }
}

/// 步骤循环的执行方式
#[derive(Debug, Clone, Copy)]
pub(crate) enum StepMode<'a> {
    /// 每一步都推送 step 事件
    Evented,
    /// 只对指定生成式能力推送文本分段，其余步骤静默执行
    Tokens { generative: &'a str },
}

pub struct PatternRunner {
    patterns: Arc<PatternStore>,
    executor: StepExecutor,
    resolver: OutputResolver,
    telemetry: Arc<TelemetryRecorder>,
    audit: Option<Arc<dyn AuditStore>>,
    options: RunnerOptions,
}

impl PatternRunner {
    pub fn new(registry: Arc<CapabilityRegistry>, patterns: Arc<PatternStore>) -> Self {
        Self {
            patterns,
            executor: StepExecutor::new(registry, None),
            resolver: OutputResolver::new(),
            telemetry: Arc::new(TelemetryRecorder::default()),
            audit: None,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_flags(mut self, gate: Arc<FeatureFlagGate>) -> Self {
        self.executor = StepExecutor::new(self.executor.registry_arc(), Some(gate));
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryRecorder>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn telemetry(&self) -> &Arc<TelemetryRecorder> {
        &self.telemetry
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// 顶层运行（深度 0）
    pub async fn run(&self, pattern_id: &str, inputs: Map<String, Value>) -> PatternResult {
        self.run_at_depth(pattern_id, inputs, 0).await
    }

    /// 在指定递归深度运行模式
    pub fn run_at_depth<'a>(
        &'a self,
        pattern_id: &'a str,
        inputs: Map<String, Value>,
        depth: usize,
    ) -> BoxFuture<'a, PatternResult> {
        async move {
            let fut = self.execute(pattern_id, inputs.clone(), depth, None, StepMode::Evented);
            self.guarded(pattern_id, &inputs, depth, fut).await
        }
        .boxed()
    }

    /// 流式运行（由 stream 模块驱动）
    pub(crate) async fn run_with_sink(
        &self,
        pattern_id: &str,
        inputs: Map<String, Value>,
        sink: &EventSink,
        mode: StepMode<'_>,
    ) -> PatternResult {
        let fut = self.execute(pattern_id, inputs.clone(), 0, Some(sink), mode);
        self.guarded(pattern_id, &inputs, 0, fut).await
    }

    /// 统一入口：经由 meta 模式；不可用时降级为直接执行。一次请求只记录一条遥测与审计
    pub async fn route(&self, request: RouteRequest) -> PatternResult {
        if let Some(meta_id) = self.options.meta_pattern.as_deref() {
            if self.patterns.contains(meta_id) {
                let mut inputs = request.inputs.clone();
                inputs.insert("capability".into(), Value::String(request.capability.clone()));
                inputs.insert("params".into(), request.params.clone());

                let attempt = self.execute(meta_id, inputs.clone(), 0, None, StepMode::Evented);
                let result = self.contained(meta_id, &inputs, 0, attempt).await;
                if !signals_unavailable(&result) {
                    self.account(&result, &inputs, 0);
                    return result;
                }
                tracing::warn!(
                    meta = %meta_id,
                    capability = %request.capability,
                    "Meta pattern has no execution context, falling back to direct execution"
                );
            } else {
                tracing::warn!(
                    meta = %meta_id,
                    capability = %request.capability,
                    "Meta pattern not registered, falling back to direct execution"
                );
            }
        }
        self.direct(request).await
    }

    /// 直接执行单个能力（fallback_mode）
    async fn direct(&self, request: RouteRequest) -> PatternResult {
        let pattern = PatternDefinition::new(
            format!("direct:{}", request.capability),
            vec![StepSpec::new(request.capability).params(request.params).stop_on_error()],
            OutputSpec::default(),
        );
        let pattern_id = pattern.id.clone();
        let fut = async {
            let mut result = self.execute_definition(&pattern, request.inputs.clone(), 0, None, StepMode::Evented).await?;
            result.data = result.state.as_map().clone();
            Ok::<_, RunnerError>(result)
        };
        let mut result = self.contained(&pattern_id, &request.inputs, 0, fut).await;
        result.fallback_mode = true;
        self.account(&result, &request.inputs, 0);
        result
    }

    async fn execute(
        &self,
        pattern_id: &str,
        inputs: Map<String, Value>,
        depth: usize,
        sink: Option<&EventSink>,
        mode: StepMode<'_>,
    ) -> Result<PatternResult, RunnerError> {
        if depth >= self.options.max_depth {
            tracing::warn!(pattern = %pattern_id, depth, max = self.options.max_depth, "Max recursion depth reached");
            return Err(RunnerError::MaxRecursionExceeded {
                depth,
                max: self.options.max_depth,
            });
        }
        let pattern = self
            .patterns
            .get(pattern_id)
            .ok_or_else(|| RunnerError::PatternNotFound(pattern_id.to_string()))?;
        self.execute_definition(&pattern, inputs, depth, sink, mode).await
    }

    async fn execute_definition(
        &self,
        pattern: &PatternDefinition,
        inputs: Map<String, Value>,
        depth: usize,
        sink: Option<&EventSink>,
        mode: StepMode<'_>,
    ) -> Result<PatternResult, RunnerError> {
        let start = Instant::now();
        let mut run = PatternRun::new(pattern.id.clone(), inputs, depth);
        tracing::debug!(pattern = %pattern.id, version = %pattern.version, depth, steps = pattern.steps.len(), "Pattern started");

        if let Some(sink) = sink {
            sink.emit(PatternEvent::PatternStart {
                pattern_id: pattern.id.clone(),
                total_steps: pattern.steps.len(),
            })
            .await?;
        }

        let mut stopped = match self.run_steps(pattern, &mut run, sink, mode).await {
            Ok(()) => None,
            Err(e @ (RunnerError::StepHalted { .. } | RunnerError::Cancelled)) => Some(e),
            Err(e) => return Err(e),
        };

        let resolved = self.resolver.resolve(&pattern.outputs, &run.state);
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Some(sink) = sink.filter(|_| stopped.is_none()) {
            let complete = PatternEvent::PatternComplete {
                pattern_id: pattern.id.clone(),
                duration_ms,
            };
            if let Err(e) = sink.emit(complete).await {
                stopped = Some(e);
            }
        }

        tracing::debug!(
            pattern = %pattern.id,
            depth,
            failed_steps = run.failed_steps(),
            warnings = resolved.warnings.len(),
            "Pattern finished"
        );

        Ok(PatternResult {
            success: stopped.is_none(),
            pattern_id: pattern.id.clone(),
            data: resolved.data,
            state: run.state,
            trace: run.trace,
            warnings: resolved.warnings,
            error: stopped.map(|e| e.to_string()),
            fallback_mode: false,
            recovery_attempted: false,
            duration_ms,
        })
    }

    async fn run_steps(
        &self,
        pattern: &PatternDefinition,
        run: &mut PatternRun,
        sink: Option<&EventSink>,
        mode: StepMode<'_>,
    ) -> Result<(), RunnerError> {
        for (index, step) in pattern.steps.iter().enumerate() {
            // 静默步骤不推送事件，需在每步开始前检查消费方是否已取消
            if sink.is_some_and(EventSink::is_closed) {
                tracing::debug!(pattern = %run.pattern_id, step = index, "Consumer gone, stopping before step");
                return Err(RunnerError::Cancelled);
            }
            let prepared = self.executor.prepare(index, step, run);
            match mode {
                StepMode::Tokens { generative } if prepared.capability == generative => {
                    self.run_generative_step(step, &prepared, run, sink).await?;
                }
                StepMode::Tokens { .. } => {
                    self.run_step(step, &prepared, run, None).await?;
                }
                StepMode::Evented => {
                    self.run_step(step, &prepared, run, sink).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &StepSpec,
        prepared: &PreparedStep,
        run: &mut PatternRun,
        sink: Option<&EventSink>,
    ) -> Result<(), RunnerError> {
        if let Some(sink) = sink {
            sink.emit(PatternEvent::StepStart {
                index: prepared.index,
                capability: prepared.capability.clone(),
                description: step.description.clone(),
            })
            .await?;
        }

        let started = Instant::now();
        let result = if prepared.capability == INVOKE_PATTERN_CAPABILITY {
            self.invoke_sub_pattern(prepared, run).await
        } else {
            self.executor.dispatch(prepared, run).await
        };
        let outcome = self.executor.apply(run, step, prepared, result, started.elapsed());
        self.finish_step(step, prepared, outcome, sink).await
    }

    /// 生成式步骤：逐段推送文本，结束后把完整文本写入状态（save_as 或 `text`）
    async fn run_generative_step(
        &self,
        step: &StepSpec,
        prepared: &PreparedStep,
        run: &mut PatternRun,
        sink: Option<&EventSink>,
    ) -> Result<(), RunnerError> {
        use futures_util::StreamExt;

        let started = Instant::now();
        let ctx = CapabilityContext::new(run.pattern_id.clone(), run.depth, run.inputs.clone());
        let registry = self.executor.registry();

        let result: CapabilityResult = match registry
            .execute_stream(&prepared.capability, prepared.params.clone(), &ctx)
            .await
        {
            Ok(mut chunks) => {
                let mut text = String::new();
                let mut failure = None;
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(piece) => {
                            text.push_str(&piece);
                            if let Some(sink) = sink {
                                sink.emit(PatternEvent::TextChunk {
                                    index: prepared.index,
                                    text: piece,
                                })
                                .await?;
                            }
                        }
                        Err(message) => {
                            failure = Some(message);
                            break;
                        }
                    }
                }
                match failure {
                    Some(message) => Err(CapabilityError::HandlerFailed {
                        capability: prepared.capability.clone(),
                        handler: registry
                            .get(&prepared.capability)
                            .map(|h| h.identity())
                            .unwrap_or_default(),
                        message,
                    }),
                    None => {
                        let mut output = Map::new();
                        output.insert("text".into(), Value::String(text));
                        Ok(output)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let outcome = self.executor.apply(run, step, prepared, result, started.elapsed());
        self.finish_step(step, prepared, outcome, sink).await
    }

    async fn finish_step(
        &self,
        step: &StepSpec,
        prepared: &PreparedStep,
        outcome: StepOutcome,
        sink: Option<&EventSink>,
    ) -> Result<(), RunnerError> {
        if outcome.is_ok() {
            if let Some(sink) = sink {
                sink.emit(PatternEvent::StepComplete {
                    index: prepared.index,
                    capability: prepared.capability.clone(),
                    duration_ms: outcome.duration_ms,
                    produced_keys: outcome.produced_keys.clone(),
                })
                .await?;
            }
            return Ok(());
        }

        let reason = outcome.error.clone().unwrap_or_default();
        let halted = step.halts_on_error();
        if let Some(sink) = sink {
            sink.emit(PatternEvent::StepError {
                index: prepared.index,
                capability: prepared.capability.clone(),
                error: reason.clone(),
                halted,
            })
            .await?;
        }
        if halted {
            return Err(RunnerError::StepHalted {
                index: prepared.index,
                capability: prepared.capability.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// `pattern.invoke`：params `{pattern_id, inputs?}`，子模式继承父输入并以 depth + 1 运行
    async fn invoke_sub_pattern(&self, prepared: &PreparedStep, run: &PatternRun) -> CapabilityResult {
        let failed = |message: String| CapabilityError::HandlerFailed {
            capability: INVOKE_PATTERN_CAPABILITY.to_string(),
            handler: "PatternRunner".to_string(),
            message,
        };

        let Some(sub_id) = prepared.params.get("pattern_id").and_then(|v| v.as_str()) else {
            return Err(failed("missing string parameter 'pattern_id'".to_string()));
        };

        let mut inputs = run.inputs.clone();
        if let Some(Value::Object(extra)) = prepared.params.get("inputs") {
            inputs.extend(extra.clone());
        }

        let result = self.run_at_depth(sub_id, inputs, run.depth + 1).await;
        if !result.success {
            return Err(failed(result.error.unwrap_or_else(|| format!("sub-pattern '{sub_id}' failed"))));
        }
        if result.data.is_empty() {
            Ok(result.state.into_map())
        } else {
            Ok(result.data)
        }
    }

    /// 捕获意外故障并记录遥测与审计
    async fn guarded<F>(&self, pattern_id: &str, inputs: &Map<String, Value>, depth: usize, fut: F) -> PatternResult
    where
        F: Future<Output = Result<PatternResult, RunnerError>> + Send,
    {
        let result = self.contained(pattern_id, inputs, depth, fut).await;
        self.account(&result, inputs, depth);
        result
    }

    /// 只做故障收敛：错误转为失败信封，panic 转入 recovery
    async fn contained<F>(&self, pattern_id: &str, inputs: &Map<String, Value>, depth: usize, fut: F) -> PatternResult
    where
        F: Future<Output = Result<PatternResult, RunnerError>> + Send,
    {
        let start = Instant::now();
        let mut result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => PatternResult::failure(pattern_id, e.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.recover(pattern_id, inputs, depth, message).await
            }
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    fn account(&self, result: &PatternResult, inputs: &Map<String, Value>, depth: usize) {
        self.record(result, inputs);
        if depth == 0 {
            self.persist(result);
        }
    }

    async fn recover(&self, pattern_id: &str, inputs: &Map<String, Value>, depth: usize, error: String) -> PatternResult {
        tracing::error!(pattern = %pattern_id, error = %error, "Unexpected orchestrator failure, attempting recovery");

        let terminal = || {
            let mut result = PatternResult::failure(pattern_id, format!("Pattern '{pattern_id}' failed unexpectedly"));
            result.recovery_attempted = true;
            result
        };

        let recovery_id = match self.options.recovery_pattern.as_deref() {
            Some(id) if id != pattern_id && self.patterns.contains(id) => id,
            _ => return terminal(),
        };

        let mut recovery_inputs = inputs.clone();
        recovery_inputs.insert("error".into(), Value::String(error));
        recovery_inputs.insert("failed_pattern".into(), Value::String(pattern_id.to_string()));

        let attempt = self.execute(recovery_id, recovery_inputs, depth, None, StepMode::Evented);
        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(Ok(mut result)) if result.success => {
                result.recovery_attempted = true;
                result
            }
            _ => {
                tracing::error!(pattern = %pattern_id, recovery = %recovery_id, "Recovery pattern failed");
                terminal()
            }
        }
    }

    fn record(&self, result: &PatternResult, inputs: &Map<String, Value>) {
        let agent = inputs
            .get("agent_id")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_AGENT_ID);
        let mut record = TelemetryRecord::new(&result.pattern_id, agent, result.success, result.duration_ms);
        if let Some(error) = &result.error {
            record = record.with_error(error.clone());
        }
        self.telemetry.track(record);
    }

    /// 尽力写入审计存储；失败只记日志
    fn persist(&self, result: &PatternResult) {
        let Some(audit) = &self.audit else {
            return;
        };
        let payload = serde_json::json!({
            "pattern_id": result.pattern_id,
            "success": result.success,
            "error": result.error,
            "duration_ms": result.duration_ms,
            "fallback_mode": result.fallback_mode,
            "recovery_attempted": result.recovery_attempted,
            "steps": result.trace,
            "warnings": result.warnings.len(),
        });
        if let Err(e) = audit.store("pattern_run", &payload) {
            tracing::warn!(pattern = %result.pattern_id, "Audit store failed: {:#}", e);
        }
    }
}

fn signals_unavailable(result: &PatternResult) -> bool {
    matches!(result.state.get(EXECUTION_UNAVAILABLE_KEY), Some(Value::Bool(true)))
}

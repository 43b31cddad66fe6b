//! 步骤执行器
//!
//! 对单个 StepSpec：按 inputs → state 解析参数模板，确定承接能力（灰度开关可改写），
//! 通过注册表调用，再把结果合并进 ExecutionState 并记录一条 StepOutcome。
//! 失败的步骤只记录，不中断运行（除非 error_handling = "stop"，由 Runner 决定是否中止）。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::capabilities::{CapabilityContext, CapabilityRegistry, CapabilityResult};
use crate::flags::FeatureFlagGate;
use crate::pattern::state::{PatternRun, StepOutcome, StepStatus};
use crate::pattern::template;
use crate::pattern::types::StepSpec;

/// 已解析、待调用的步骤
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub index: usize,
    /// 实际承接的能力名（灰度命中时为 flag.capability）
    pub capability: String,
    pub params: Value,
}

pub struct StepExecutor {
    registry: Arc<CapabilityRegistry>,
    flags: Option<Arc<FeatureFlagGate>>,
}

impl StepExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, flags: Option<Arc<FeatureFlagGate>>) -> Self {
        Self { registry, flags }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn registry_arc(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.registry)
    }

    /// 解析参数并确定承接能力
    pub fn prepare(&self, index: usize, step: &StepSpec, run: &PatternRun) -> PreparedStep {
        let inputs = &run.inputs;
        let state = run.state.as_map();

        let missing = template::unresolved(&step.params, inputs, state);
        if !missing.is_empty() {
            tracing::warn!(
                pattern = %run.pattern_id,
                step = index,
                capability = %step.capability,
                unresolved = ?missing,
                "Unresolved placeholders passed through verbatim"
            );
        }

        PreparedStep {
            index,
            capability: self.route(step, run),
            params: template::resolve(&step.params, inputs, state),
        }
    }

    fn route(&self, step: &StepSpec, run: &PatternRun) -> String {
        match (&step.flag, &self.flags) {
            (Some(route), Some(gate)) if gate.is_enabled(&route.name, &run.inputs) => {
                tracing::debug!(
                    flag = %route.name,
                    from = %step.capability,
                    to = %route.capability,
                    "Step routed by feature flag"
                );
                route.capability.clone()
            }
            _ => step.capability.clone(),
        }
    }

    /// 调用注册表
    pub async fn dispatch(&self, prepared: &PreparedStep, run: &PatternRun) -> CapabilityResult {
        let ctx = CapabilityContext::new(run.pattern_id.clone(), run.depth, run.inputs.clone());
        self.registry
            .execute(&prepared.capability, prepared.params.clone(), &ctx)
            .await
    }

    /// 合并结果并追加 StepOutcome（无论成败）
    pub fn apply(
        &self,
        run: &mut PatternRun,
        step: &StepSpec,
        prepared: &PreparedStep,
        result: CapabilityResult,
        elapsed: Duration,
    ) -> StepOutcome {
        let duration_ms = elapsed.as_millis() as u64;
        let outcome = match result {
            Ok(output) => StepOutcome {
                index: prepared.index,
                capability: prepared.capability.clone(),
                status: StepStatus::Ok,
                duration_ms,
                produced_keys: run.state.merge(output, step.save_as.as_deref()),
                error: None,
                error_detail: None,
            },
            Err(e) => {
                tracing::warn!(
                    pattern = %run.pattern_id,
                    step = prepared.index,
                    capability = %prepared.capability,
                    error = %e,
                    "Step failed"
                );
                StepOutcome {
                    index: prepared.index,
                    capability: prepared.capability.clone(),
                    status: StepStatus::Error,
                    duration_ms,
                    produced_keys: Vec::new(),
                    error: Some(short_reason(&e.to_string())),
                    error_detail: Some(e.to_value()),
                }
            }
        };
        run.trace.push(outcome.clone());
        outcome
    }
}

/// 面向用户的简短原因（截断原始错误文本）
fn short_reason(message: &str) -> String {
    const MAX: usize = 160;
    if message.chars().count() > MAX {
        format!("{}...", message.chars().take(MAX).collect::<String>())
    } else {
        message.to_string()
    }
}

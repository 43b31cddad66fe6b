//! 流式执行
//!
//! 消费方拉取事件；生产者在独立任务中运行，通过容量为 1 的有界通道逐个交付，
//! 每次推送后挂起直到被消费，严格保持步骤顺序。
//! 事件顺序：pattern_start → (step_start → step_complete | step_error)* → pattern_complete → final_result，
//! 或以 execution_error 结束。消费方提前取消只停止后续事件，不回滚已完成步骤写入的状态。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::RunnerError;
use crate::pattern::runner::{PatternRunner, StepMode};
use crate::pattern::state::PatternResult;

/// 单个流式事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternEvent {
    PatternStart { pattern_id: String, total_steps: usize },
    StepStart {
        index: usize,
        capability: String,
        description: String,
    },
    StepComplete {
        index: usize,
        capability: String,
        duration_ms: u64,
        produced_keys: Vec<String>,
    },
    /// halted 为 true 时模式随之终止
    StepError {
        index: usize,
        capability: String,
        error: String,
        halted: bool,
    },
    /// 生成式步骤的一段文本
    TextChunk { index: usize, text: String },
    PatternComplete { pattern_id: String, duration_ms: u64 },
    FinalResult { result: Box<PatternResult> },
    ExecutionError { error: String },
}

impl PatternEvent {
    /// 是否为终止事件（之后不会再有事件）
    pub fn is_terminal(&self) -> bool {
        matches!(self, PatternEvent::FinalResult { .. } | PatternEvent::ExecutionError { .. })
    }
}

/// 生产端：推送失败（接收端已关闭）或被取消时返回 Cancelled
pub(crate) struct EventSink {
    tx: mpsc::Sender<PatternEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub(crate) async fn emit(&self, event: PatternEvent) -> Result<(), RunnerError> {
        if self.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunnerError::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| RunnerError::Cancelled),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// 消费端：按顺序拉取事件；drop 或 cancel() 即终止生产者
pub struct PatternStream {
    rx: mpsc::Receiver<PatternEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<PatternResult>>,
}

impl PatternStream {
    pub async fn next_event(&mut self) -> Option<PatternEvent> {
        self.rx.recv().await
    }

    /// 取消：生产者在当前步骤结束后停止，不再产生事件
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    /// 丢弃剩余事件，等待生产者结束并取回结果（取消时 success 为 false，已写入的状态保留）
    pub async fn finish(mut self) -> Option<PatternResult> {
        while self.rx.recv().await.is_some() {}
        let handle = self.handle.take()?;
        handle.await.ok()
    }

    /// 拉取全部事件直至结束
    pub async fn collect_events(mut self) -> Vec<PatternEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for PatternStream {
    type Item = PatternEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PatternStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 流式模式
#[derive(Debug, Clone)]
pub enum StreamMode {
    /// 推送每一步的 start / complete / error 事件
    Steps,
    /// 静默执行其余步骤，仅把指定生成式能力的输出以文本分段推送
    Tokens { generative_capability: String },
}

impl PatternRunner {
    /// 以步骤事件流方式运行模式
    pub fn stream(self: &Arc<Self>, pattern_id: impl Into<String>, inputs: Map<String, Value>) -> PatternStream {
        self.stream_with(pattern_id, inputs, StreamMode::Steps)
    }

    /// 以文本分段方式运行模式：generative_capability 步骤之前的步骤静默执行
    pub fn stream_tokens(
        self: &Arc<Self>,
        pattern_id: impl Into<String>,
        inputs: Map<String, Value>,
        generative_capability: impl Into<String>,
    ) -> PatternStream {
        self.stream_with(
            pattern_id,
            inputs,
            StreamMode::Tokens {
                generative_capability: generative_capability.into(),
            },
        )
    }

    pub fn stream_with(
        self: &Arc<Self>,
        pattern_id: impl Into<String>,
        inputs: Map<String, Value>,
        mode: StreamMode,
    ) -> PatternStream {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink = EventSink {
            tx,
            cancel: cancel.clone(),
        };
        let runner = Arc::clone(self);
        let pattern_id = pattern_id.into();

        let handle = tokio::spawn(async move {
            let step_mode = match &mode {
                StreamMode::Steps => StepMode::Evented,
                StreamMode::Tokens { generative_capability } => StepMode::Tokens {
                    generative: generative_capability.as_str(),
                },
            };
            let result = runner.run_with_sink(&pattern_id, inputs, &sink, step_mode).await;

            let terminal = if result.success {
                PatternEvent::FinalResult {
                    result: Box::new(result.clone()),
                }
            } else {
                PatternEvent::ExecutionError {
                    error: result.error.clone().unwrap_or_else(|| "execution failed".to_string()),
                }
            };
            if sink.is_closed() {
                tracing::debug!(pattern = %pattern_id, "Stream cancelled by consumer");
            } else {
                let _ = sink.emit(terminal).await;
            }
            result
        });

        PatternStream {
            rx,
            cancel,
            handle: Some(handle),
        }
    }
}

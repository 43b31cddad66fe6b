//! 执行遥测
//!
//! 原始记录存放在有界环形缓冲（默认 1000 条，FIFO 淘汰），同时维护独立的累计聚合
//! （总数、成功数、按 agent / pattern 计数、耗时总和），淘汰原始记录不影响聚合的精确性。
//! 进程级共享：写入通过互斥锁串行化，读取时复制快照。

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1000;

/// 单次执行记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// 毫秒时间戳
    pub timestamp: i64,
    pub success: bool,
    pub duration_ms: u64,
    pub pattern_id: String,
    /// 能力名或调用方 agent 标识
    pub agent_id: String,
    pub error: Option<String>,
}

impl TelemetryRecord {
    pub fn new(pattern_id: impl Into<String>, agent_id: impl Into<String>, success: bool, duration_ms: u64) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            success,
            duration_ms,
            pattern_id: pattern_id.into(),
            agent_id: agent_id.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// 只读汇总快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub total_executions: u64,
    /// 0.0 – 1.0；无记录时为 0
    pub success_rate: f64,
    /// 四舍五入后的平均耗时
    pub avg_duration_ms: u64,
    pub by_agent: BTreeMap<String, u64>,
    pub by_pattern: BTreeMap<String, u64>,
    /// 最近一条记录的时间（RFC 3339）
    pub last_execution: Option<String>,
}

struct Inner {
    buffer: VecDeque<TelemetryRecord>,
    capacity: usize,
    total: u64,
    successes: u64,
    duration_sum_ms: u128,
    by_agent: BTreeMap<String, u64>,
    by_pattern: BTreeMap<String, u64>,
    last_timestamp: Option<i64>,
}

pub struct TelemetryRecorder {
    inner: Mutex<Inner>,
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_CAPACITY)
    }
}

impl TelemetryRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                capacity,
                total: 0,
                successes: 0,
                duration_sum_ms: 0,
                by_agent: BTreeMap::new(),
                by_pattern: BTreeMap::new(),
                last_timestamp: None,
            }),
        }
    }

    pub fn track(&self, record: TelemetryRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total += 1;
        if record.success {
            inner.successes += 1;
        }
        inner.duration_sum_ms += u128::from(record.duration_ms);
        *inner.by_agent.entry(record.agent_id.clone()).or_insert(0) += 1;
        *inner.by_pattern.entry(record.pattern_id.clone()).or_insert(0) += 1;
        inner.last_timestamp = Some(record.timestamp);

        if inner.buffer.len() >= inner.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(record);
    }

    pub fn summary(&self) -> TelemetrySummary {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (success_rate, avg_duration_ms) = if inner.total == 0 {
            (0.0, 0)
        } else {
            (
                inner.successes as f64 / inner.total as f64,
                (inner.duration_sum_ms as f64 / inner.total as f64).round() as u64,
            )
        };
        TelemetrySummary {
            total_executions: inner.total,
            success_rate,
            avg_duration_ms,
            by_agent: inner.by_agent.clone(),
            by_pattern: inner.by_pattern.clone(),
            last_execution: inner
                .last_timestamp
                .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
                .map(|t| t.to_rfc3339()),
        }
    }

    /// 最新的 n 条原始记录（从旧到新）
    pub fn recent(&self, n: usize) -> Vec<TelemetryRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.buffer.len().saturating_sub(n);
        inner.buffer.iter().skip(skip).cloned().collect()
    }

    /// 当前缓冲中的原始记录数（不超过容量）
    pub fn buffered(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).buffer.len()
    }
}

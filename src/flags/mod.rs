//! 灰度开关
//!
//! is_enabled(flag, context)：读取开关配置（enabled + rollout_percentage 0–100），
//! 配置最多每个 reload_interval 从来源重读一次（惰性、按时间门控，无后台定时任务）。
//! 百分比介于 0 与 100 之间时按 `sha256(flag + ":" + identifier) mod 100 < percentage` 分桶，
//! 同一身份在配置不变时结果恒定；调高百分比只会把 false 变成 true。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::FlagError;

/// 依次尝试的身份字段（用户 → 组合 → 请求）
pub const IDENTIFIER_FIELDS: [&str; 3] = ["user_id", "portfolio_id", "request_id"];
/// 上下文中没有任何身份字段时使用的常量
pub const FALLBACK_IDENTIFIER: &str = "anonymous";

/// 单个开关配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rollout_percentage: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl FlagSpec {
    pub fn rollout(percentage: f64) -> Self {
        Self {
            enabled: true,
            rollout_percentage: percentage,
            ..Self::default()
        }
    }
}

/// 分类 → 开关名 → 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagConfig {
    pub categories: BTreeMap<String, BTreeMap<String, FlagSpec>>,
}

impl FlagConfig {
    pub fn with_flag(mut self, category: &str, name: &str, spec: FlagSpec) -> Self {
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(name.to_string(), spec);
        self
    }

    /// `category.flag` 形式优先；否则在所有分类中按开关名查找
    pub fn lookup(&self, flag: &str) -> Option<&FlagSpec> {
        let name = match flag.split_once('.') {
            Some((category, name)) => {
                if let Some(spec) = self.categories.get(category).and_then(|c| c.get(name)) {
                    return Some(spec);
                }
                name
            }
            None => flag,
        };
        self.categories.values().find_map(|c| c.get(name))
    }
}

/// 开关配置来源
pub trait FlagSource: Send + Sync {
    fn load(&self) -> Result<FlagConfig, FlagError>;
}

/// JSON 文件来源
#[derive(Debug, Clone)]
pub struct JsonFileFlagSource {
    path: PathBuf,
}

impl JsonFileFlagSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl FlagSource for JsonFileFlagSource {
    fn load(&self) -> Result<FlagConfig, FlagError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| FlagError::ConfigLoad(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&raw).map_err(|e| FlagError::Parse(format!("{}: {e}", self.path.display())))
    }
}

/// 内存来源（测试与嵌入式使用），可在运行时替换配置
#[derive(Debug, Default)]
pub struct StaticFlagSource {
    config: Mutex<FlagConfig>,
}

impl StaticFlagSource {
    pub fn new(config: FlagConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn set(&self, config: FlagConfig) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }
}

impl FlagSource for StaticFlagSource {
    fn load(&self) -> Result<FlagConfig, FlagError> {
        Ok(self.config.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

impl<S: FlagSource + ?Sized> FlagSource for Arc<S> {
    fn load(&self) -> Result<FlagConfig, FlagError> {
        (**self).load()
    }
}

/// 一次开关判定（每次计算，不持久化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureFlagDecision {
    pub flag: String,
    pub enabled: bool,
    pub rollout_percentage: f64,
    pub identifier: String,
}

struct FlagCache {
    config: Arc<FlagConfig>,
    loaded_at: Option<Instant>,
}

/// 灰度开关门
pub struct FeatureFlagGate {
    source: Box<dyn FlagSource>,
    reload_interval: Duration,
    cache: Mutex<FlagCache>,
}

impl FeatureFlagGate {
    pub fn new(source: impl FlagSource + 'static, reload_interval: Duration) -> Self {
        Self {
            source: Box::new(source),
            reload_interval,
            cache: Mutex::new(FlagCache {
                config: Arc::new(FlagConfig::default()),
                loaded_at: None,
            }),
        }
    }

    /// 从 JSON 文件构建
    pub fn from_file(path: impl AsRef<Path>, reload_interval: Duration) -> Self {
        Self::new(JsonFileFlagSource::new(path), reload_interval)
    }

    /// 当前配置快照；距上次加载超过 reload_interval 时重读，读取失败视为全部关闭，下个周期重试。
    /// 读取来源时不持有缓存锁，并发判定只在替换快照时短暂串行
    fn config(&self) -> Arc<FlagConfig> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            let fresh = cache
                .loaded_at
                .is_some_and(|at| at.elapsed() < self.reload_interval);
            if fresh {
                return Arc::clone(&cache.config);
            }
        }

        let config = match self.source.load() {
            Ok(config) => Arc::new(config),
            Err(e) => {
                tracing::warn!(error = %e, "Feature flag reload failed, treating all flags as disabled");
                Arc::new(FlagConfig::default())
            }
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.config = Arc::clone(&config);
        cache.loaded_at = Some(Instant::now());
        config
    }

    /// 完整判定结果
    pub fn decide(&self, flag: &str, context: &Map<String, Value>) -> FeatureFlagDecision {
        let identifier = identifier_from(context);
        let config = self.config();
        let (enabled, percentage) = match config.lookup(flag) {
            Some(spec) => (evaluate(flag, &identifier, spec), spec.rollout_percentage),
            None => (false, 0.0),
        };
        tracing::debug!(flag, identifier = %identifier, enabled, percentage, "Feature flag evaluated");
        FeatureFlagDecision {
            flag: flag.to_string(),
            enabled,
            rollout_percentage: percentage,
            identifier,
        }
    }

    pub fn is_enabled(&self, flag: &str, context: &Map<String, Value>) -> bool {
        self.decide(flag, context).enabled
    }
}

fn evaluate(flag: &str, identifier: &str, spec: &FlagSpec) -> bool {
    if !spec.enabled || spec.rollout_percentage <= 0.0 {
        return false;
    }
    if spec.rollout_percentage >= 100.0 {
        return true;
    }
    (bucket(flag, identifier) as f64) < spec.rollout_percentage
}

/// 稳定分桶：sha256 前 8 字节（大端）mod 100
pub fn bucket(flag: &str, identifier: &str) -> u64 {
    let digest = Sha256::digest(format!("{flag}:{identifier}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % 100
}

/// 按 IDENTIFIER_FIELDS 顺序取第一个存在的身份字段
pub fn identifier_from(context: &Map<String, Value>) -> String {
    IDENTIFIER_FIELDS
        .iter()
        .find_map(|field| match context.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| FALLBACK_IDENTIFIER.to_string())
}

//! 模式目录
//!
//! 从目录加载 `*.json` / `*.toml` 模式文件并缓存；加载后只读。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::pattern::types::PatternDefinition;

#[derive(Debug, Default, Clone)]
pub struct PatternStore {
    patterns: HashMap<String, Arc<PatternDefinition>>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入模式；同 id 覆盖时记 warn
    pub fn insert(&mut self, pattern: PatternDefinition) {
        let id = pattern.id.clone();
        if self.patterns.insert(id.clone(), Arc::new(pattern)).is_some() {
            tracing::warn!(pattern = %id, "Pattern redefined, last definition wins");
        }
    }

    pub fn with(mut self, pattern: PatternDefinition) -> Self {
        self.insert(pattern);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<PatternDefinition>> {
        self.patterns.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.patterns.contains_key(id)
    }

    /// 已加载的模式 id（排序）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.patterns.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// 解析单个模式文件（按扩展名选择 JSON 或 TOML）
    pub fn parse_file(path: &Path) -> anyhow::Result<PatternDefinition> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pattern file {}", path.display()))?;
        let pattern = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw)
                .with_context(|| format!("Invalid TOML pattern {}", path.display()))?,
            _ => serde_json::from_str(&raw)
                .with_context(|| format!("Invalid JSON pattern {}", path.display()))?,
        };
        Ok(pattern)
    }

    /// 加载目录下所有模式文件；单个文件解析失败只记 warn 并跳过。目录不存在时返回 0
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> anyhow::Result<usize> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(0);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match Self::parse_file(&path) {
                Ok(pattern) => {
                    self.insert(pattern);
                    loaded += 1;
                }
                Err(e) => tracing::warn!("Skipping pattern file: {:#}", e),
            }
        }
        tracing::info!("Loaded {} patterns from {}", loaded, dir.display());
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dir_json_and_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("overview.json"),
            r#"{"id": "overview", "steps": [{"capability": "echo", "args": {"text": "hi"}}], "outputs": ["text"]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("alerts.toml"),
            r#"
id = "alerts"
name = "Alert presets"
outputs = ["presets"]

[[steps]]
capability = "alerts.suggest_presets"
as = "presets"
error_handling = "stop"

[steps.args]
portfolio_id = "{portfolio_id}"
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut store = PatternStore::new();
        let loaded = store.load_dir(dir.path()).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(store.ids(), vec!["alerts".to_string(), "overview".to_string()]);

        let alerts = store.get("alerts").unwrap();
        assert_eq!(alerts.steps[0].save_as.as_deref(), Some("presets"));
        assert!(alerts.steps[0].halts_on_error());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let mut store = PatternStore::new();
        assert_eq!(store.load_dir("/definitely/not/here").unwrap(), 0);
        assert!(store.is_empty());
    }
}

//! 输出解析器
//!
//! 将模式声明的输出（键列表 / 键映射 / 面板）对应到最终状态中的键。
//! 面板 id 按三条规则收集匹配：精确相等、以 `_id` 结尾、以 `id_` 开头。
//! 多个匹配时只报告歧义，不自动挑选。所有发现均为建议性警告，绝不报错，也不影响执行。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::pattern::state::ExecutionState;
use crate::pattern::types::{OutputSpec, Panel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    MissingKey,
    OrphanedPanel,
    AmbiguousPanel,
    InvalidDataPath,
}

/// 解析警告（建议性）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolverWarning {
    pub kind: WarningKind,
    /// 出问题的输出键或面板 id
    pub subject: String,
    pub message: String,
    /// 相关的状态键：缺失时为全部可用键，歧义时为所有候选键
    pub keys: Vec<String>,
}

/// 解析结果
#[derive(Debug, Clone, Default)]
pub struct ResolvedOutputs {
    pub data: Map<String, Value>,
    pub warnings: Vec<ResolverWarning>,
}

/// 面板 id 与状态键的匹配规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    Suffix,
    Prefix,
}

/// 收集面板 id 在状态键中的全部匹配（按键排序，去重）
pub fn panel_matches(panel_id: &str, keys: &[String]) -> Vec<(String, MatchRule)> {
    let suffix = format!("_{panel_id}");
    let prefix = format!("{panel_id}_");
    keys.iter()
        .filter_map(|key| {
            let rule = if key == panel_id {
                MatchRule::Exact
            } else if key.ends_with(&suffix) {
                MatchRule::Suffix
            } else if key.starts_with(&prefix) {
                MatchRule::Prefix
            } else {
                return None;
            };
            Some((key.clone(), rule))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct OutputResolver;

impl OutputResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, spec: &OutputSpec, state: &ExecutionState) -> ResolvedOutputs {
        let mut out = ResolvedOutputs::default();
        match spec {
            OutputSpec::Keys(keys) => {
                for key in keys {
                    self.resolve_key(key, state, &mut out);
                }
            }
            OutputSpec::Mapping(mapping) => {
                for key in mapping.keys() {
                    self.resolve_key(key, state, &mut out);
                }
            }
            OutputSpec::Panels { panels } => {
                for panel in panels {
                    self.resolve_panel(panel, state, &mut out);
                }
            }
        }

        for w in &out.warnings {
            tracing::warn!(kind = ?w.kind, subject = %w.subject, "{}", w.message);
        }
        out
    }

    fn resolve_key(&self, key: &str, state: &ExecutionState, out: &mut ResolvedOutputs) {
        match state.get(key) {
            Some(v) => {
                out.data.insert(key.to_string(), v.clone());
            }
            None => {
                let available = state.keys();
                out.warnings.push(ResolverWarning {
                    kind: WarningKind::MissingKey,
                    subject: key.to_string(),
                    message: format!(
                        "Declared output '{key}' not found in state; available keys: [{}]",
                        available.join(", ")
                    ),
                    keys: available,
                });
            }
        }
    }

    fn resolve_panel(&self, panel: &Panel, state: &ExecutionState, out: &mut ResolvedOutputs) {
        let keys = state.keys();
        let matches = panel_matches(&panel.id, &keys);

        match matches.len() {
            0 => out.warnings.push(ResolverWarning {
                kind: WarningKind::OrphanedPanel,
                subject: panel.id.clone(),
                message: format!(
                    "Orphaned panel '{}': no state key matches; available keys: [{}]",
                    panel.id,
                    keys.join(", ")
                ),
                keys: keys.clone(),
            }),
            1 => {
                if panel.data_path.is_none() {
                    if let Some(v) = state.get(&matches[0].0) {
                        out.data.insert(panel.id.clone(), v.clone());
                    }
                }
            }
            _ => {
                let candidates: Vec<String> = matches.into_iter().map(|(k, _)| k).collect();
                out.warnings.push(ResolverWarning {
                    kind: WarningKind::AmbiguousPanel,
                    subject: panel.id.clone(),
                    message: format!(
                        "Ambiguous panel '{}': {} state keys match [{}]; none selected",
                        panel.id,
                        candidates.len(),
                        candidates.join(", ")
                    ),
                    keys: candidates,
                });
            }
        }

        if let Some(path) = panel.data_path.as_deref() {
            self.resolve_data_path(panel, path, state, out);
        }
    }

    fn resolve_data_path(&self, panel: &Panel, path: &str, state: &ExecutionState, out: &mut ResolvedOutputs) {
        let mut segments = path.split('.');
        let root = segments.next().unwrap_or_default();
        let rest: Vec<&str> = segments.collect();

        let Some(root_value) = state.get(root) else {
            out.warnings.push(ResolverWarning {
                kind: WarningKind::InvalidDataPath,
                subject: panel.id.clone(),
                message: format!(
                    "Panel '{}' dataPath '{path}': root '{root}' not found in state",
                    panel.id
                ),
                keys: state.keys(),
            });
            return;
        };

        if rest.is_empty() {
            out.data.insert(panel.id.clone(), root_value.clone());
            return;
        }

        if !root_value.is_object() {
            out.warnings.push(ResolverWarning {
                kind: WarningKind::InvalidDataPath,
                subject: panel.id.clone(),
                message: format!(
                    "Panel '{}' dataPath '{path}': root '{root}' is not an object",
                    panel.id
                ),
                keys: vec![root.to_string()],
            });
            return;
        }

        let nested = rest
            .iter()
            .try_fold(root_value, |cur, seg| cur.as_object().and_then(|m| m.get(*seg)));
        if let Some(v) = nested {
            out.data.insert(panel.id.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(v: Value) -> ExecutionState {
        ExecutionState::from(v.as_object().cloned().unwrap_or_default())
    }

    fn panels(items: Vec<(&str, Option<&str>)>) -> OutputSpec {
        OutputSpec::Panels {
            panels: items
                .into_iter()
                .map(|(id, path)| Panel {
                    id: id.to_string(),
                    data_path: path.map(String::from),
                })
                .collect(),
        }
    }

    #[test]
    fn test_declared_key_present() {
        let out = OutputResolver::new().resolve(
            &OutputSpec::Keys(vec!["mwr".into()]),
            &state(json!({"mwr": {"value": 0.07}})),
        );
        assert!(out.warnings.is_empty());
        assert_eq!(out.data["mwr"], json!({"value": 0.07}));
    }

    #[test]
    fn test_missing_key_lists_available() {
        let out = OutputResolver::new().resolve(
            &OutputSpec::Keys(vec!["missing_key".into()]),
            &state(json!({"a": 1})),
        );
        assert_eq!(out.warnings.len(), 1);
        let w = &out.warnings[0];
        assert_eq!(w.kind, WarningKind::MissingKey);
        assert!(w.message.contains("missing_key"));
        assert_eq!(w.keys, vec!["a".to_string()]);
    }

    #[test]
    fn test_mapping_form_checks_keys() {
        let spec: OutputSpec = serde_json::from_value(json!({"twr": "Time-weighted", "dcf": "Valuation"})).unwrap();
        let out = OutputResolver::new().resolve(&spec, &state(json!({"twr": 0.1})));
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].subject, "dcf");
        assert_eq!(out.data["twr"], json!(0.1));
    }

    #[test]
    fn test_panel_ambiguous_not_selected() {
        let out = OutputResolver::new().resolve(&panels(vec![("x", None)]), &state(json!({"a_x": 1, "x_b": 2})));
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].kind, WarningKind::AmbiguousPanel);
        assert_eq!(out.warnings[0].keys, vec!["a_x".to_string(), "x_b".to_string()]);
        assert!(!out.data.contains_key("x"));
    }

    #[test]
    fn test_panel_single_match_rules() {
        let keys = vec!["x".to_string(), "pre_y".to_string(), "z_post".to_string(), "other".to_string()];
        assert_eq!(panel_matches("x", &keys), vec![("x".to_string(), MatchRule::Exact)]);
        assert_eq!(panel_matches("y", &keys), vec![("pre_y".to_string(), MatchRule::Suffix)]);
        assert_eq!(panel_matches("z", &keys), vec![("z_post".to_string(), MatchRule::Prefix)]);
    }

    #[test]
    fn test_orphaned_panel() {
        let out = OutputResolver::new().resolve(&panels(vec![("alerts", None)]), &state(json!({"twr": 1})));
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].kind, WarningKind::OrphanedPanel);
    }

    #[test]
    fn test_data_path_validation() {
        let s = state(json!({"perf": {"twr": 0.1}, "count": 3}));
        let out = OutputResolver::new().resolve(
            &panels(vec![("perf", Some("perf.twr")), ("count", Some("count.value")), ("gone", Some("nothing"))]),
            &s,
        );
        assert_eq!(out.data["perf"], json!(0.1));
        let kinds: Vec<_> = out.warnings.iter().map(|w| (w.subject.as_str(), w.kind)).collect();
        assert!(kinds.contains(&("count", WarningKind::InvalidDataPath)));
        assert!(kinds.contains(&("gone", WarningKind::InvalidDataPath)));
        assert!(kinds.contains(&("gone", WarningKind::OrphanedPanel)));
    }

    #[test]
    fn test_malformed_specs_never_fail() {
        let s = state(json!({"": 1, "_": 2}));
        let out = OutputResolver::new().resolve(&panels(vec![("", Some("")), ("_", Some(".."))]), &s);
        assert!(out.warnings.len() <= 4);
        let empty = OutputResolver::new().resolve(&OutputSpec::Keys(vec![]), &ExecutionState::new());
        assert!(empty.warnings.is_empty() && empty.data.is_empty());
    }
}

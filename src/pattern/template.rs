//! 参数模板解析
//!
//! `{name}` 先在输入上下文查找，再在累积状态查找；支持 `{a.b.c}` 访问嵌套字段。
//! 整个字符串恰好是一个占位符时替换为原类型的值，嵌入在文本中的占位符做字符串插值。
//! 解析不到的占位符原样保留，不报错。

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}").expect("valid placeholder regex")
    })
}

/// 按 inputs → state 的顺序查找（点号路径逐级下钻）
pub fn lookup<'a>(path: &str, inputs: &'a Map<String, Value>, state: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    let mut current = inputs.get(root).or_else(|| state.get(root))?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// 递归解析参数模板
pub fn resolve(template: &Value, inputs: &Map<String, Value>, state: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => resolve_str(s, inputs, state),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, inputs, state)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, inputs, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_str(s: &str, inputs: &Map<String, Value>, state: &Map<String, Value>) -> Value {
    let re = placeholder_regex();

    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            return match lookup(&caps[1], inputs, state) {
                Some(v) => v.clone(),
                None => {
                    tracing::debug!(placeholder = %s, "Unresolved placeholder left verbatim");
                    Value::String(s.to_string())
                }
            };
        }
    } else {
        return Value::String(s.to_string());
    }

    let replaced = re.replace_all(s, |caps: &Captures| match lookup(&caps[1], inputs, state) {
        Some(Value::String(v)) => v.clone(),
        Some(v) => v.to_string(),
        None => caps[0].to_string(),
    });
    Value::String(replaced.into_owned())
}

/// 模板中引用但无法解析的占位符名（去重，按出现顺序）
pub fn unresolved(template: &Value, inputs: &Map<String, Value>, state: &Map<String, Value>) -> Vec<String> {
    let mut missing = Vec::new();
    collect_unresolved(template, inputs, state, &mut missing);
    missing
}

fn collect_unresolved(template: &Value, inputs: &Map<String, Value>, state: &Map<String, Value>, out: &mut Vec<String>) {
    match template {
        Value::String(s) => {
            for caps in placeholder_regex().captures_iter(s) {
                let name = caps[1].to_string();
                if lookup(&name, inputs, state).is_none() && !out.contains(&name) {
                    out.push(name);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_unresolved(v, inputs, state, out)),
        Value::Object(map) => map.values().for_each(|v| collect_unresolved(v, inputs, state, out)),
        _ => {}
    }
}

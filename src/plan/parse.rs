//! 规划协作方回复解析
//!
//! 协作方可能在 JSON 前后夹带说明文字：取第一个顶层 `{...}` 片段（按括号深度匹配，忽略字符串内的括号）再反序列化。

use serde::Deserialize;
use serde_json::Value;

use crate::plan::Step;

/// 返回第一个顶层 `{...}` 片段；没有完整片段时返回 None
pub fn extract_json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 提取并解析为 JSON 对象
pub fn extract_json_object(text: &str) -> Option<Value> {
    let span = extract_json_span(text)?;
    match serde_json::from_str::<Value>(span) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<Step>,
    // 读取但不信任：新计划总是从 0 开始
    #[serde(default)]
    #[allow(dead_code)]
    current_step: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

/// 解析失败的原因（仅用于日志；对外表现一律是空计划）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unparseable {
    NoJson,
    InvalidShape(String),
}

impl std::fmt::Display for Unparseable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unparseable::NoJson => write!(f, "no JSON object in response"),
            Unparseable::InvalidShape(e) => write!(f, "invalid plan JSON: {}", e),
        }
    }
}

/// 从协作方回复中解析候选步骤
pub fn parse_plan_response(text: &str) -> Result<Vec<Step>, Unparseable> {
    let span = extract_json_span(text).ok_or(Unparseable::NoJson)?;
    let raw: RawPlan =
        serde_json::from_str(span).map_err(|e| Unparseable::InvalidShape(e.to_string()))?;
    Ok(raw.steps)
}

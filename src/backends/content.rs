//! 工具调用结果与后端响应形状
//!
//! 后端返回两种形状：扁平值，或带类型的内容片段列表（`{"content": [{"type": "text", ...}], "isError": false}`）。
//! ToolResponse 把两者建模为带标签的变体，normalize 只拼接 text 片段（按响应顺序、换行连接），其余片段静默丢弃。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 单步执行结果。success=true 时 error 仍可能带诊断文本（部分失败），仅作提示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// 内容片段；未知类型落到 Other
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSegment {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        data: String,
        #[serde(default, rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        #[serde(default)]
        resource: Value,
    },
    #[serde(other)]
    Other,
}

/// tools/call 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResponse {
    Value(Value),
    Segments {
        segments: Vec<ContentSegment>,
        is_error: bool,
    },
}

impl ToolResponse {
    /// 根据 JSON-RPC result 判定形状：含 content 数组即片段列表，否则为扁平值
    pub fn from_result(result: Value) -> Self {
        let Some(items) = result.get("content").and_then(Value::as_array) else {
            return ToolResponse::Value(result);
        };
        let segments = items
            .iter()
            .map(|item| {
                serde_json::from_value::<ContentSegment>(item.clone())
                    .unwrap_or(ContentSegment::Other)
            })
            .collect();
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        ToolResponse::Segments { segments, is_error }
    }

    pub fn normalize(&self) -> String {
        match self {
            ToolResponse::Value(Value::String(s)) => s.clone(),
            ToolResponse::Value(Value::Null) => String::new(),
            ToolResponse::Value(v) => v.to_string(),
            ToolResponse::Segments { segments, .. } => segments
                .iter()
                .filter_map(|s| match s {
                    ContentSegment::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResponse::Segments { is_error: true, .. })
    }

    pub fn into_tool_result(self) -> ToolResult {
        let text = self.normalize();
        if self.is_error() {
            ToolResult {
                success: false,
                output: text.clone(),
                error: Some(if text.is_empty() {
                    "tool reported an error".to_string()
                } else {
                    text
                }),
            }
        } else {
            ToolResult::ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_segments_joined_in_order() {
        let resp = ToolResponse::from_result(json!({
            "content": [
                {"type": "text", "text": "Exit code: 0"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "--- STDOUT ---"},
                {"type": "audio", "data": "xx"}
            ]
        }));
        assert_eq!(resp.normalize(), "Exit code: 0\n--- STDOUT ---");
    }

    #[test]
    fn test_flat_value() {
        assert_eq!(ToolResponse::from_result(json!("plain")).normalize(), "plain");
        assert_eq!(
            ToolResponse::from_result(json!({"open": [22, 80]})).normalize(),
            r#"{"open":[22,80]}"#
        );
        assert_eq!(ToolResponse::from_result(Value::Null).normalize(), "");
    }

    #[test]
    fn test_is_error_becomes_failure() {
        let result = ToolResponse::from_result(json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        }))
        .into_tool_result();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_malformed_segment_dropped() {
        let resp = ToolResponse::from_result(json!({
            "content": [{"type": "text"}, {"type": "text", "text": "ok"}]
        }));
        assert_eq!(resp.normalize(), "ok");
    }
}

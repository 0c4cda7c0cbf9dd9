//! 知识库后端调用（stdio 传输）
//!
//! 两种调用形状：rag_recall（按观察结果回忆）与 rag_search（按查询检索），top_k 缺省为 3。
//! 返回的嵌套载荷总是以 JSON 字符串放进 output；外层 success 跟随嵌套 success，
//! 仅当嵌套失败时才填 error。

use serde_json::{json, Map, Value};

use crate::backends::{BackendConnection, ToolResult};
use crate::core::EngineError;

/// 以此前缀开头的工具一律发往知识库后端
pub const KNOWLEDGE_PREFIX: &str = "rag_";
pub const RAG_RECALL: &str = "rag_recall";
pub const RAG_SEARCH: &str = "rag_search";
pub const DEFAULT_TOP_K: u64 = 3;

pub fn is_knowledge_tool(tool: &str) -> bool {
    tool.starts_with(KNOWLEDGE_PREFIX)
}

/// 静态基线：无论知识库是否在线都进入白名单（离线时分发会快速失败）
pub fn baseline_tools() -> Vec<(String, String)> {
    vec![
        (
            RAG_RECALL.to_string(),
            "Recall knowledge relevant to an observation (past findings, exploitation notes). \
             Args: {\"observation\": string, \"top_k\": int (default 3)}"
                .to_string(),
        ),
        (
            RAG_SEARCH.to_string(),
            "Search the knowledge base by free-text query. \
             Args: {\"query\": string, \"top_k\": int (default 3)}"
                .to_string(),
        ),
    ]
}

/// 知识库调用形状
#[derive(Debug, Clone, PartialEq)]
pub enum KnowledgeQuery {
    Recall { observation: String, top_k: u64 },
    Search { query: String, top_k: u64 },
    /// 其它 rag_* 工具，原样转发
    Other,
}

impl KnowledgeQuery {
    pub fn parse(tool: &str, args: &Map<String, Value>) -> Result<Self, EngineError> {
        let text = |key: &str| -> Result<String, EngineError> {
            args.get(key)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| EngineError::Protocol(format!("{} requires a '{}' string", tool, key)))
        };
        match tool {
            RAG_RECALL => Ok(KnowledgeQuery::Recall {
                observation: text("observation")?,
                top_k: top_k(args),
            }),
            RAG_SEARCH => Ok(KnowledgeQuery::Search {
                query: text("query")?,
                top_k: top_k(args),
            }),
            _ => Ok(KnowledgeQuery::Other),
        }
    }

    fn arguments(&self) -> Option<Value> {
        match self {
            KnowledgeQuery::Recall { observation, top_k } => {
                Some(json!({"observation": observation, "top_k": top_k}))
            }
            KnowledgeQuery::Search { query, top_k } => Some(json!({"query": query, "top_k": top_k})),
            KnowledgeQuery::Other => None,
        }
    }
}

/// 读取结果数量提示；缺失或不是正数时用默认值
fn top_k(args: &Map<String, Value>) -> u64 {
    args.get("top_k")
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .filter(|k| *k > 0)
        .unwrap_or(DEFAULT_TOP_K)
}

/// 把嵌套文本解释为 `{success, error?, ...}` 载荷
pub fn nested_result(text: &str) -> ToolResult {
    let payload = serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({"success": true, "raw": text}));
    let success = payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let error = (!success).then(|| {
        payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("knowledge query failed")
            .to_string()
    });
    ToolResult {
        success,
        output: payload.to_string(),
        error,
    }
}

pub async fn call(
    conn: &dyn BackendConnection,
    tool: &str,
    args: &Map<String, Value>,
) -> Result<ToolResult, EngineError> {
    let query = KnowledgeQuery::parse(tool, args)?;
    match query.arguments() {
        Some(arguments) => {
            let response = conn.call_tool(tool, arguments).await?;
            if response.is_error() {
                let mut error = response.normalize();
                if error.is_empty() {
                    error = "knowledge server reported an error".to_string();
                }
                let payload = json!({"success": false, "error": error});
                return Ok(nested_result(&payload.to_string()));
            }
            Ok(nested_result(&response.normalize()))
        }
        None => Ok(conn
            .call_tool(tool, Value::Object(args.clone()))
            .await?
            .into_tool_result()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::router::tests::FakeConnection;
    use crate::backends::ToolResponse;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_top_k_defaults_to_three() {
        let q = KnowledgeQuery::parse(RAG_RECALL, &args(json!({"observation": "port 22 open"}))).unwrap();
        assert_eq!(
            q,
            KnowledgeQuery::Recall {
                observation: "port 22 open".to_string(),
                top_k: 3
            }
        );
        let q = KnowledgeQuery::parse(RAG_SEARCH, &args(json!({"query": "vsftpd", "top_k": "lots"}))).unwrap();
        assert!(matches!(q, KnowledgeQuery::Search { top_k: 3, .. }));
    }

    #[test]
    fn test_explicit_top_k() {
        let q = KnowledgeQuery::parse(RAG_SEARCH, &args(json!({"query": "smb", "top_k": 7}))).unwrap();
        assert!(matches!(q, KnowledgeQuery::Search { top_k: 7, .. }));
    }

    #[test]
    fn test_missing_required_text() {
        assert!(KnowledgeQuery::parse(RAG_RECALL, &Map::new()).is_err());
    }

    #[test]
    fn test_nested_success_mirrored() {
        let ok = nested_result(r#"{"success": true, "results": ["a"]}"#);
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = nested_result(r#"{"success": false, "error": "index missing"}"#);
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("index missing"));
        // output 仍是完整载荷
        let v: Value = serde_json::from_str(&failed.output).unwrap();
        assert_eq!(v["error"], "index missing");
    }

    #[test]
    fn test_nested_non_json_wrapped() {
        let r = nested_result("plain text");
        assert!(r.success);
        let v: Value = serde_json::from_str(&r.output).unwrap();
        assert_eq!(v["raw"], "plain text");
    }

    #[tokio::test]
    async fn test_server_error_still_yields_json_output() {
        let mut conn = FakeConnection::new(&[]);
        conn.reply = Box::new(|_, _| {
            Ok(ToolResponse::from_result(json!({
                "content": [{"type": "text", "text": "collection not loaded"}],
                "isError": true
            })))
        });
        let r = call(&conn, RAG_SEARCH, &args(json!({"query": "vsftpd"})))
            .await
            .unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("collection not loaded"));
        let v: Value = serde_json::from_str(&r.output).unwrap();
        assert_eq!(v, json!({"success": false, "error": "collection not loaded"}));
        assert_eq!(conn.calls()[0].1["top_k"], 3);
    }

    #[test]
    fn test_prefix_routing() {
        assert!(is_knowledge_tool("rag_recall"));
        assert!(is_knowledge_tool("rag_anything"));
        assert!(!is_knowledge_tool("execute_shell_cmd"));
    }
}

//! 后端路由
//!
//! 持有两个相互独立、各自可选的连接：stdio 知识库后端与 HTTP 执行后端。
//! rag_* 工具发往知识库，其余一律发往执行后端；未连接或已断开的后端直接返回失败结果，不排队、不重连。
//! 白名单 = 知识库基线工具 ∪ 执行后端连接时 tools/list 发现的工具，连接时生成一次快照。

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::backends::knowledge::{self, is_knowledge_tool};
use crate::backends::{McpClient, McpToolInfo, McpTransportConfig, ToolResponse, ToolResult};
use crate::config::BackendsSection;
use crate::core::EngineError;
use crate::plan::{ToolCatalog, Whitelist};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// stdio 传输的知识检索服务
    Knowledge,
    /// HTTP 传输的执行服务
    Execution,
}

impl BackendKind {
    pub fn for_tool(tool: &str) -> Self {
        if is_knowledge_tool(tool) {
            BackendKind::Knowledge
        } else {
            BackendKind::Execution
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Knowledge => write!(f, "RAG MCP server"),
            BackendKind::Execution => write!(f, "Kali MCP server"),
        }
    }
}

/// 单个后端连接（MCP 客户端或测试替身）
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn is_alive(&self) -> bool;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, EngineError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResponse, EngineError>;

    async fn close(&self);
}

#[async_trait]
impl BackendConnection for McpClient {
    fn is_alive(&self) -> bool {
        McpClient::is_alive(self)
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, EngineError> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResponse, EngineError> {
        McpClient::call_tool(self, name, arguments).await
    }

    async fn close(&self) {
        self.disconnect().await
    }
}

/// 计划执行器看到的分发接口：永不返回错误，失败一律折叠进 ToolResult
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool: &str, args: &Map<String, Value>) -> ToolResult;
}

/// 连接时捕获的能力快照，之后只读
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub whitelist: Whitelist,
    /// (工具名, 描述)，用于规划提示词
    pub descriptions: Vec<(String, String)>,
}

impl Capabilities {
    fn build(discovered: &[McpToolInfo]) -> Self {
        let mut descriptions = knowledge::baseline_tools();
        for tool in discovered {
            if descriptions.iter().any(|(name, _)| name == &tool.name) {
                continue;
            }
            descriptions.push((tool.name.clone(), tool.description.clone()));
        }
        let whitelist = Whitelist::new(descriptions.iter().map(|(name, _)| name.clone()));
        Self {
            whitelist,
            descriptions,
        }
    }

    pub fn catalog(&self) -> ToolCatalog {
        ToolCatalog::new(self.descriptions.iter().cloned())
    }
}

pub struct BackendRouter {
    knowledge: Option<Arc<dyn BackendConnection>>,
    execution: Option<Arc<dyn BackendConnection>>,
    capabilities: Capabilities,
}

impl BackendRouter {
    /// 两个后端都不在线（仅基线白名单）
    pub fn disconnected() -> Self {
        Self {
            knowledge: None,
            execution: None,
            capabilities: Capabilities::build(&[]),
        }
    }

    /// 按配置分别尝试连接；任一失败只记日志并把该后端标为不可用，不影响另一个
    pub async fn initialize(config: &BackendsSection) -> Self {
        let knowledge: Option<Arc<dyn BackendConnection>> = match &config.knowledge {
            Some(section) => {
                let transport = McpTransportConfig::Stdio {
                    command: section.command.clone(),
                    args: section.args.clone(),
                    env: section.env.clone(),
                };
                match McpClient::connect("rag", &transport).await {
                    Ok(client) => Some(Arc::new(client)),
                    Err(e) => {
                        tracing::warn!(backend = %BackendKind::Knowledge, error = %e, "Backend unavailable, continuing without it");
                        None
                    }
                }
            }
            None => None,
        };

        let execution: Option<Arc<dyn BackendConnection>> = match &config.execution {
            Some(section) => {
                let transport = McpTransportConfig::Http {
                    url: section.url.clone(),
                    headers: section.headers.clone(),
                    connect_timeout_secs: section.connect_timeout_secs,
                };
                match McpClient::connect("kali", &transport).await {
                    Ok(client) => Some(Arc::new(client)),
                    Err(e) => {
                        tracing::warn!(backend = %BackendKind::Execution, error = %e, "Backend unavailable, continuing without it");
                        None
                    }
                }
            }
            None => None,
        };

        Self::with_connections(knowledge, execution).await
    }

    /// 用已建立的连接构建路由，并向执行后端查询一次工具清单
    pub async fn with_connections(
        knowledge: Option<Arc<dyn BackendConnection>>,
        execution: Option<Arc<dyn BackendConnection>>,
    ) -> Self {
        let (execution, discovered) = match execution {
            Some(conn) => match conn.list_tools().await {
                Ok(tools) => {
                    tracing::info!(
                        backend = %BackendKind::Execution,
                        count = tools.len(),
                        "Discovered execution tools"
                    );
                    (Some(conn), tools)
                }
                Err(e) => {
                    tracing::warn!(backend = %BackendKind::Execution, error = %e, "Tool discovery failed, marking backend unavailable");
                    conn.close().await;
                    (None, Vec::new())
                }
            },
            None => (None, Vec::new()),
        };

        Self {
            knowledge,
            execution,
            capabilities: Capabilities::build(&discovered),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn whitelist(&self) -> Whitelist {
        self.capabilities.whitelist.clone()
    }

    fn connection(&self, kind: BackendKind) -> Option<&Arc<dyn BackendConnection>> {
        match kind {
            BackendKind::Knowledge => self.knowledge.as_ref(),
            BackendKind::Execution => self.execution.as_ref(),
        }
    }

    pub fn is_connected(&self, kind: BackendKind) -> bool {
        self.connection(kind).map(|c| c.is_alive()).unwrap_or(false)
    }

    /// 关闭两个连接；不存在的直接跳过
    pub async fn shutdown(&self) {
        for (kind, conn) in [
            (BackendKind::Knowledge, &self.knowledge),
            (BackendKind::Execution, &self.execution),
        ] {
            if let Some(conn) = conn {
                conn.close().await;
                tracing::info!(backend = %kind, "Backend connection released");
            }
        }
    }

    async fn forward(&self, tool: &str, args: &Map<String, Value>) -> Result<ToolResult, EngineError> {
        let kind = BackendKind::for_tool(tool);
        let conn = self
            .connection(kind)
            .filter(|c| c.is_alive())
            .ok_or_else(|| EngineError::BackendUnavailable(kind.to_string()))?;
        match kind {
            BackendKind::Knowledge => knowledge::call(conn.as_ref(), tool, args).await,
            BackendKind::Execution => Ok(conn
                .call_tool(tool, Value::Object(args.clone()))
                .await?
                .into_tool_result()),
        }
    }
}

#[async_trait]
impl ToolDispatcher for BackendRouter {
    async fn dispatch(&self, tool: &str, args: &Map<String, Value>) -> ToolResult {
        let start = Instant::now();
        let result = self
            .forward(tool, args)
            .await
            .unwrap_or_else(|e| ToolResult::failure(e.to_string()));

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "backend": BackendKind::for_tool(tool).to_string(),
            "ok": result.success,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit, "tool");
        result
    }
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

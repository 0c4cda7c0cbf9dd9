//! 后端层：MCP 客户端、响应归一化、知识库调用形状与双后端路由

pub mod content;
pub mod knowledge;
pub mod mcp_client;
pub mod router;

pub use content::{ContentSegment, ToolResponse, ToolResult};
pub use mcp_client::{McpClient, McpToolInfo, McpTransportConfig};
pub use router::{BackendConnection, BackendKind, BackendRouter, Capabilities, ToolDispatcher};

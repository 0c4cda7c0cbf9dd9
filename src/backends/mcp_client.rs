//! MCP 客户端
//!
//! 与工具服务端之间的 JSON-RPC 2.0 连接，支持两种传输：
//! stdio（子进程，按行分隔的 JSON）与 streamable HTTP（JSON 或 SSE 回复，会话头回显）。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::backends::ToolResponse;
use crate::core::EngineError;

const PROTOCOL_VERSION: &str = "2024-11-05";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "mcp-session-id";

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpTransportConfig {
    /// 启动子进程，经 stdin/stdout 通信
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// 向远端地址 POST JSON-RPC
    #[serde(rename = "http")]
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        connect_timeout_secs: u64,
    },
}

/// `tools/list` 返回的工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    /// 通知没有 id
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// 服务端主动推送的通知两个字段都为空
    fn is_reply(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    fn into_result(self, method: &str) -> Result<Value, EngineError> {
        if let Some(e) = self.error {
            return Err(EngineError::Protocol(format!(
                "{} failed: [{}] {}",
                method, e.code, e.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

struct StdioTransport {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct HttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    session_id: Option<String>,
}

enum ActiveTransport {
    Stdio(StdioTransport),
    Http(HttpTransport),
    Closed,
}

/// 到一个工具服务端的连接。请求经传输层互斥锁串行发送；
/// 传输层出错后连接永久标记为失效，不会自动重连。
pub struct McpClient {
    name: String,
    transport: Mutex<ActiveTransport>,
    request_id: AtomicU64,
    alive: AtomicBool,
}

impl McpClient {
    /// 建立连接并完成 `initialize` / `notifications/initialized` 握手
    pub async fn connect(name: &str, config: &McpTransportConfig) -> Result<Self, EngineError> {
        let transport = match config {
            McpTransportConfig::Stdio { command, args, env } => {
                ActiveTransport::Stdio(spawn_stdio(name, command, args, env)?)
            }
            McpTransportConfig::Http {
                url,
                headers,
                connect_timeout_secs,
            } => {
                let mut builder = reqwest::Client::builder();
                if *connect_timeout_secs > 0 {
                    builder = builder.connect_timeout(Duration::from_secs(*connect_timeout_secs));
                }
                let client = builder.build().map_err(|e| {
                    EngineError::Connection(format!("failed to create HTTP client: {}", e))
                })?;
                ActiveTransport::Http(HttpTransport {
                    url: url.clone(),
                    client,
                    headers: headers.clone(),
                    session_id: None,
                })
            }
        };

        let client = Self {
            name: name.to_string(),
            transport: Mutex::new(transport),
            request_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        };

        let init = client.request(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "autored",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        );
        let server_info = tokio::time::timeout(HANDSHAKE_TIMEOUT, init)
            .await
            .map_err(|_| {
                EngineError::Connection(format!("{}: timed out during initialize", name))
            })?
            .map_err(|e| EngineError::Connection(format!("{}: {}", name, e)))?;

        client.notify("notifications/initialized").await?;

        let server = server_info
            .get("serverInfo")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        tracing::info!(backend = %name, server = %server, "MCP handshake complete");
        Ok(client)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// `tools/list`
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, EngineError> {
        let result = self.request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| serde_json::from_value::<McpToolInfo>(t).ok())
            .filter(|t| !t.name.is_empty())
            .collect())
    }

    /// `tools/call`
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResponse, EngineError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", Some(params)).await?;
        Ok(ToolResponse::from_result(result))
    }

    /// 结束子进程（stdio）或丢弃会话（HTTP），可重复调用
    pub async fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut transport = self.transport.lock().await;
        if let ActiveTransport::Stdio(stdio) = &mut *transport {
            let _ = stdio.stdin.shutdown().await;
            let _ = stdio.process.kill().await;
        }
        *transport = ActiveTransport::Closed;
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        };

        let mut transport = self.transport.lock().await;
        let outcome = match &mut *transport {
            ActiveTransport::Stdio(stdio) => match write_line(&mut stdio.stdin, &request).await {
                Ok(()) => read_reply(&mut stdio.stdout).await,
                Err(e) => Err(e),
            },
            ActiveTransport::Http(http) => post(http, &request).await,
            ActiveTransport::Closed => Err(EngineError::Transport("connection closed".to_string())),
        };

        match outcome {
            Ok(response) => response.into_result(method),
            Err(e) => {
                if matches!(e, EngineError::Transport(_)) {
                    tracing::warn!(backend = %self.name, error = %e, "Marking backend connection dead");
                    self.alive.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), EngineError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params: Some(serde_json::json!({})),
        };
        let mut transport = self.transport.lock().await;
        match &mut *transport {
            ActiveTransport::Stdio(stdio) => write_line(&mut stdio.stdin, &request).await,
            ActiveTransport::Http(http) => {
                // 202 Accepted，无响应体
                let _ = send_http(http, &request).await?;
                Ok(())
            }
            ActiveTransport::Closed => Err(EngineError::Transport("connection closed".to_string())),
        }
    }
}

fn spawn_stdio(
    name: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<StdioTransport, EngineError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut process = cmd.spawn().map_err(|e| {
        EngineError::Connection(format!(
            "Failed to spawn MCP server '{}' (command: {}): {}",
            name, command, e
        ))
    })?;
    let stdin = process.stdin.take().ok_or_else(|| {
        EngineError::Connection(format!("Failed to capture stdin for MCP server '{}'", name))
    })?;
    let stdout = process.stdout.take().ok_or_else(|| {
        EngineError::Connection(format!("Failed to capture stdout for MCP server '{}'", name))
    })?;

    Ok(StdioTransport {
        process,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn write_line(stdin: &mut ChildStdin, request: &JsonRpcRequest) -> Result<(), EngineError> {
    let mut msg = serde_json::to_string(request)?;
    msg.push('\n');
    stdin
        .write_all(msg.as_bytes())
        .await
        .map_err(|e| EngineError::Transport(format!("write to MCP server stdin: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| EngineError::Transport(format!("flush MCP server stdin: {}", e)))
}

/// 逐行读取直到拿到 JSON-RPC 回复；空行、日志输出与通知都跳过
async fn read_reply(reader: &mut BufReader<ChildStdout>) -> Result<JsonRpcResponse, EngineError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| EngineError::Transport(format!("read MCP server stdout: {}", e)))?;
        if n == 0 {
            return Err(EngineError::Transport(
                "MCP server closed stdout (process may have crashed)".to_string(),
            ));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) {
            if response.is_reply() {
                return Ok(response);
            }
        }
    }
}

async fn send_http(
    http: &HttpTransport,
    request: &JsonRpcRequest,
) -> Result<reqwest::Response, EngineError> {
    let mut builder = http
        .client
        .post(&http.url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream");
    for (key, value) in &http.headers {
        builder = builder.header(key, value);
    }
    if let Some(session) = &http.session_id {
        builder = builder.header(SESSION_HEADER, session);
    }

    let response = builder
        .json(request)
        .send()
        .await
        .map_err(|e| EngineError::Transport(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(EngineError::Protocol(format!(
            "MCP server returned HTTP {}: {}",
            status, body
        )));
    }
    Ok(response)
}

async fn post(http: &mut HttpTransport, request: &JsonRpcRequest) -> Result<JsonRpcResponse, EngineError> {
    let response = send_http(http, request).await?;

    if let Some(session) = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        http.session_id = Some(session.to_string());
    }
    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    let body = response
        .text()
        .await
        .map_err(|e| EngineError::Transport(format!("read response body: {}", e)))?;

    if is_sse {
        parse_sse_reply(&body)
    } else {
        serde_json::from_str::<JsonRpcResponse>(&body)
            .map_err(|e| EngineError::Protocol(format!("invalid JSON-RPC response: {}", e)))
    }
}

/// 取第一条是 JSON-RPC 回复的 `data:` 事件
fn parse_sse_reply(body: &str) -> Result<JsonRpcResponse, EngineError> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .find(JsonRpcResponse::is_reply)
        .ok_or_else(|| EngineError::Protocol("no JSON-RPC reply in event stream".to_string()))
}

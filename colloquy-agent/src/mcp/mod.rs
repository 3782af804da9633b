//! MCP servers spoken to over a child process's stdio, one JSON-RPC message
//! per line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clients::ToolDefinition;
use crate::tools::{ToolError, ToolExecutor};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-request timeout; 0 selects the default.
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl MCPServerConfig {
    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            0 => Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            secs => Duration::from_secs(secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MCPConfig {
    #[serde(default)]
    pub servers: HashMap<String, MCPServerConfig>,
}

#[derive(Debug, Error)]
pub enum MCPError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Server not found: {0}")]
    ServerNotFound(String),
    #[error("Tool call failed: {0}")]
    ToolCallFailed(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Server error {code}: {message}")]
    ServerError { code: i64, message: String },
}

impl From<serde_json::Error> for MCPError {
    fn from(e: serde_json::Error) -> Self {
        MCPError::ProtocolError(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// A message without an id; no response is expected.
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, MCPError> {
        match self.error {
            Some(error) => Err(MCPError::ServerError {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

impl McpTool {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self
                .input_schema
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenated text items.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Serializes one message as a single line.
pub fn encode_message<T: Serialize>(message: &T) -> Result<String, MCPError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line from the server. Lines that are not JSON-RPC responses
/// (server notifications, log output) yield `None`.
pub fn parse_response_line(line: &str) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    if value.get("id").is_none_or(Value::is_null) {
        return None;
    }
    serde_json::from_value(value).ok()
}

pub type Reader = Box<dyn AsyncBufRead + Unpin + Send>;
pub type Writer = Box<dyn AsyncWrite + Unpin + Send>;

struct Channel {
    reader: Reader,
    writer: Writer,
}

pub struct McpClient {
    name: String,
    channel: Mutex<Channel>,
    child: Option<Child>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl McpClient {
    /// Spawns the server and performs the initialize handshake.
    pub async fn connect(name: &str, config: &MCPServerConfig) -> Result<Self, MCPError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MCPError::ConnectionFailed(format!("failed to spawn '{}': {}", config.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed("failed to capture stdout".to_string()))?;

        let mut client = Self::from_streams(
            name,
            Box::new(BufReader::new(stdout)),
            Box::new(stdin),
            config.timeout(),
        );
        client.child = Some(child);
        client.initialize().await?;
        Ok(client)
    }

    /// Wraps an already-open transport. The handshake is left to the caller.
    pub fn from_streams(name: &str, reader: Reader, writer: Writer, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            channel: Mutex::new(Channel { reader, writer }),
            child: None,
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, channel: &mut Channel, message: &JsonRpcRequest) -> Result<(), MCPError> {
        let line = encode_message(message)?;
        channel
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
        channel
            .writer
            .flush()
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, MCPError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let mut channel = self.channel.lock().await;
        self.send(&mut channel, &request).await?;

        let wait = async {
            let mut line = String::new();
            loop {
                line.clear();
                let read = channel
                    .reader
                    .read_line(&mut line)
                    .await
                    .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
                if read == 0 {
                    return Err(MCPError::ConnectionFailed(format!(
                        "server '{}' closed its output",
                        self.name
                    )));
                }
                match parse_response_line(&line) {
                    Some(response) if response.id == Some(id) => return response.into_result(),
                    Some(response) => {
                        debug!(server = %self.name, id = ?response.id, "skipping unexpected response")
                    }
                    None => debug!(server = %self.name, "skipping non-response line"),
                }
            }
        };

        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| MCPError::Timeout(format!("{} on '{}'", method, self.name)))?
    }

    pub async fn notify(&self, method: &str) -> Result<(), MCPError> {
        let mut channel = self.channel.lock().await;
        self.send(&mut channel, &JsonRpcRequest::notification(method)).await
    }

    pub async fn initialize(&self) -> Result<Value, MCPError> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params)).await?;
        self.notify("notifications/initialized").await?;
        info!(server = %self.name, "MCP server initialized");
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, MCPError> {
        let result = self.request("tools/list", None).await?;
        let list: ListToolsResult = serde_json::from_value(result)?;
        debug!(server = %self.name, tools = list.tools.len(), "listed MCP tools");
        Ok(list.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, MCPError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(server = %self.name, error = %e, "failed to stop MCP server");
            }
        }
    }
}

/// Routes tool calls to the server that advertised the tool.
#[derive(Default)]
pub struct MCPManager {
    clients: HashMap<String, Arc<McpClient>>,
    tools: HashMap<String, String>,
    definitions: Vec<ToolDefinition>,
    config: MCPConfig,
}

impl MCPManager {
    pub fn new(config: MCPConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub async fn connect_server(&mut self, name: &str) -> Result<(), MCPError> {
        let server_config = self
            .config
            .servers
            .get(name)
            .ok_or_else(|| MCPError::ServerNotFound(name.to_string()))?;

        let client = McpClient::connect(name, server_config).await?;
        self.add_client(client).await
    }

    /// Connects every configured server, returning the ones that failed.
    pub async fn connect_all(&mut self) -> Vec<(String, MCPError)> {
        let mut names: Vec<String> = self.config.servers.keys().cloned().collect();
        names.sort();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.connect_server(&name).await {
                warn!(server = %name, error = %e, "MCP server unavailable");
                failures.push((name, e));
            }
        }
        failures
    }

    /// Registers an initialized client and its tools.
    pub async fn add_client(&mut self, client: McpClient) -> Result<(), MCPError> {
        let server = client.name().to_string();
        for tool in client.list_tools().await? {
            if let Some(previous) = self.tools.insert(tool.name.clone(), server.clone()) {
                warn!(tool = %tool.name, previous = %previous, server = %server, "tool name shadowed");
                self.definitions.retain(|d| d.name != tool.name);
            }
            self.definitions.push(tool.definition());
        }
        self.clients.insert(server, Arc::new(client));
        Ok(())
    }

    pub async fn disconnect_server(&mut self, name: &str) -> Result<(), MCPError> {
        let client = self
            .clients
            .remove(name)
            .ok_or_else(|| MCPError::ServerNotFound(name.to_string()))?;
        let removed: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, server)| server.as_str() == name)
            .map(|(tool, _)| tool.clone())
            .collect();
        for tool in &removed {
            self.tools.remove(tool);
        }
        self.definitions.retain(|d| !removed.contains(&d.name));
        if let Ok(mut client) = Arc::try_unwrap(client) {
            client.disconnect().await;
        }
        Ok(())
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<CallToolResult, MCPError> {
        let server_name = self
            .tools
            .get(tool_name)
            .ok_or_else(|| MCPError::ToolCallFailed(format!("Unknown tool: {}", tool_name)))?;
        let client = self
            .clients
            .get(server_name)
            .ok_or_else(|| MCPError::ServerNotFound(server_name.clone()))?;
        client.call_tool(tool_name, arguments).await
    }

    pub fn list_tools(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.name.clone()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn servers(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

#[async_trait]
impl ToolExecutor for MCPManager {
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        if !self.has_tool(name) {
            return Err(ToolError::NotFound(name.to_string()));
        }
        let arguments: Value = if arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))?
        };

        match self.call_tool(name, arguments).await {
            Ok(result) if result.is_error => Err(ToolError::ExecutionFailed(result.text())),
            Ok(result) => Ok(result.text()),
            Err(MCPError::ConnectionFailed(e)) => Err(ToolError::Fatal(e)),
            Err(e) => Err(ToolError::ExecutionFailed(e.to_string())),
        }
    }

    fn catalog(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

/// Reads an `mcp.json` file. A missing file is an empty configuration.
pub async fn load_mcp_config(config_path: &Path) -> Result<MCPConfig, MCPError> {
    if !config_path.exists() {
        return Ok(MCPConfig::default());
    }

    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| MCPError::ProtocolError(e.to_string()))?;

    Ok(serde_json::from_str(&content)?)
}

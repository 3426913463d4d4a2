//! MCP bridge — tools served by external processes over stdio JSON-RPC.
//!
//! Each configured server is spawned, handshaken with `initialize`, and
//! asked for `tools/list`. Every remote tool becomes an [`McpTool`] in the
//! registry, named `<server>__<tool>` and classed `requires-approval`.
//! Messages are line-delimited JSON, one object per line.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use termagent_config::McpServerConfig;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to start MCP server '{server}': {reason}")]
    Spawn { server: String, reason: String },

    #[error("MCP server '{server}' transport error: {reason}")]
    Transport { server: String, reason: String },

    #[error("MCP server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("MCP server '{server}' did not start within {secs}s")]
    StartupTimeout { server: String, secs: u64 },

    #[error("MCP server '{server}' sent an invalid {what}: {reason}")]
    Protocol {
        server: String,
        what: &'static str,
        reason: String,
    },
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Deserialize)]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    is_error: bool,
    #[serde(default, rename = "structuredContent")]
    structured_content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default, rename = "mimeType")]
        mime_type: String,
    },
    #[serde(other)]
    Other,
}

struct Io {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A running stdio MCP server.
pub struct McpClient {
    server: String,
    io: Mutex<Io>,
    child: Mutex<Child>,
    next_id: AtomicU64,
}

impl McpClient {
    /// Spawn the server process. No handshake is performed.
    pub fn spawn(
        server: &str,
        config: &McpServerConfig,
        default_cwd: &Path,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .current_dir(config.cwd.as_deref().unwrap_or(default_cwd))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Spawn {
                server: server.to_string(),
                reason: "stdio pipes unavailable".into(),
            });
        };

        Ok(Self {
            server: server.to_string(),
            io: Mutex::new(Io {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn transport(&self, reason: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    async fn write_line(&self, io: &mut Io, value: &impl Serialize) -> Result<(), McpError> {
        let mut line = serde_json::to_string(value)
            .map_err(|e| self.transport(format!("failed to serialize message: {e}")))?;
        line.push('\n');
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport(format!("failed to write to stdin: {e}")))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| self.transport(format!("failed to flush stdin: {e}")))
    }

    /// Send a request and read lines until the response with the same id.
    ///
    /// Lines that are not JSON-RPC responses (server logging, notifications)
    /// and responses to other ids are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut io = self.io.lock().await;
        self.write_line(
            &mut io,
            &JsonRpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            },
        )
        .await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = io
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| self.transport(format!("failed to read from stdout: {e}")))?;
            if read == 0 {
                return Err(self.transport("server stdout closed"));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(response) if response.id == id => return extract_result(response),
                Ok(_) => continue,
                Err(_) => debug!(server = %self.server, line = %trimmed, "Skipping non-response line"),
            }
        }
    }

    /// Send a notification. No response is read.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut message = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        let mut io = self.io.lock().await;
        self.write_line(&mut io, &message).await
    }

    /// `initialize` followed by `notifications/initialized`.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let result = self
            .request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "termagent",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
            )
            .await?;
        debug!(server = %self.server, info = %result["serverInfo"], "MCP server initialized");
        self.notify("notifications/initialized", None).await
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let result = self.request("tools/list", None).await?;
        let parsed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol {
                server: self.server.clone(),
                what: "tools/list result",
                reason: e.to_string(),
            })?;
        Ok(parsed.tools)
    }

    /// Invoke a remote tool and flatten its content into a [`ToolOutput`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, McpError> {
        let result = self
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let parsed: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol {
                server: self.server.clone(),
                what: "tools/call result",
                reason: e.to_string(),
            })?;

        let text = parsed
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::Image { mime_type } => format!("[image {mime_type}]"),
                ContentBlock::Other => "[unsupported content]".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let output = if parsed.is_error {
            ToolOutput::failed(text)
        } else {
            ToolOutput::ok(text)
        };
        Ok(match parsed.structured_content {
            Some(data) => output.with_data(data),
            None => output,
        })
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(server = %self.server, error = %e, "MCP server already exited");
        }
    }
}

fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Server {
            code: err.code,
            message: err.message,
        });
    }
    response.result.ok_or(McpError::Server {
        code: -32603,
        message: "response missing both result and error".into(),
    })
}

/// A remote tool exposed through the [`Tool`] trait.
pub struct McpTool {
    client: Arc<McpClient>,
    name: String,
    remote_name: String,
    description: String,
    schema: serde_json::Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, definition: McpToolDefinition) -> Self {
        let name = qualified_name(client.server(), &definition.name);
        let schema = if definition.input_schema.is_object() {
            definition.input_schema
        } else {
            serde_json::json!({ "type": "object" })
        };
        Self {
            client,
            name,
            remote_name: definition.name,
            description: definition.description,
            schema,
        }
    }
}

/// `<server>__<tool>`, restricted to characters providers accept in names.
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{server}__{tool}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::RequiresApproval
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        self.client
            .call_tool(&self.remote_name, arguments)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// A connected server and the tools it advertised.
pub struct McpServer {
    pub client: Arc<McpClient>,
    pub tools: Vec<McpToolDefinition>,
}

impl McpServer {
    /// Spawn, handshake and list tools within the configured startup timeout.
    pub async fn connect(
        name: &str,
        config: &McpServerConfig,
        default_cwd: &Path,
    ) -> Result<Self, McpError> {
        let client = Arc::new(McpClient::spawn(name, config, default_cwd)?);
        let secs = config.startup_timeout_secs;
        let startup = async {
            client.initialize().await?;
            client.list_tools().await
        };
        match tokio::time::timeout(Duration::from_secs(secs), startup).await {
            Ok(Ok(tools)) => Ok(Self { client, tools }),
            Ok(Err(e)) => {
                client.shutdown().await;
                Err(e)
            }
            Err(_) => {
                client.shutdown().await;
                Err(McpError::StartupTimeout {
                    server: name.to_string(),
                    secs,
                })
            }
        }
    }

    pub fn adapters(&self) -> impl Iterator<Item = McpTool> + '_ {
        self.tools
            .iter()
            .map(|def| McpTool::new(Arc::clone(&self.client), def.clone()))
    }
}

/// Connect every enabled server. Failures are logged and skipped.
pub async fn connect_all(
    servers: &BTreeMap<String, McpServerConfig>,
    default_cwd: &Path,
) -> Vec<McpServer> {
    let mut connected = Vec::new();
    for (name, config) in servers.iter().filter(|(_, c)| c.enabled) {
        match McpServer::connect(name, config, default_cwd).await {
            Ok(server) => {
                info!(server = %name, tools = server.tools.len(), "MCP server connected");
                connected.push(server);
            }
            Err(e) => warn!(server = %name, error = %e, "Skipping MCP server"),
        }
    }
    connected
}

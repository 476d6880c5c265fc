//! In-process MCP server for built-in providers.
//!
//! Wraps a `ToolRegistry` and answers MCP requests for it, so built-in tools
//! travel the same session path as external providers.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use switchyard_tool_runtime::{ContentItem, ToolContext, ToolOutput, ToolRegistry};

use crate::error::McpError;
use crate::transport::{ChannelTransport, McpTransport};
use crate::types::*;

/// MCP server that bridges a `ToolRegistry` to MCP clients.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    server_name: String,
    server_version: String,
    initialized: bool,
    working_directory: PathBuf,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            server_name: "switchyard".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            initialized: false,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the working directory for tool execution.
    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = dir;
        self
    }

    /// Run this server on a background task and return the client end of a
    /// linked channel pair. The server exits when the client end is closed.
    pub fn spawn_in_process(mut self) -> ChannelTransport {
        let (client_side, mut server_side) = ChannelTransport::pair();
        tokio::spawn(async move {
            if let Err(e) = self.run(&mut server_side).await {
                tracing::warn!(server = %self.server_name, error = %e, "in-process server failed");
            }
        });
        client_side
    }

    /// Run the server loop, reading from and writing to the transport.
    ///
    /// Processes JSON-RPC requests until the transport is closed.
    pub async fn run<T: McpTransport + ?Sized>(&mut self, transport: &mut T) -> Result<(), McpError> {
        tracing::debug!(server = %self.server_name, "MCP server starting");

        while let Some(line) = transport.receive().await? {
            tracing::trace!(message = %line, "Received message");

            let request = match IncomingMessage::parse(&line) {
                Ok(IncomingMessage::Request(request)) => request,
                Ok(IncomingMessage::Notification(notif)) => {
                    self.handle_notification(&notif);
                    continue;
                }
                Ok(IncomingMessage::Response(_)) => {
                    tracing::debug!("Ignoring unsolicited response");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse JSON-RPC message");
                    let resp = JsonRpcResponse {
                        jsonrpc: "2.0".to_string(),
                        id: RpcId::Number(0),
                        result: None,
                        error: Some(McpError::JsonParse(e).to_rpc_error()),
                    };
                    transport.send(&serde_json::to_string(&resp)?).await?;
                    continue;
                }
            };

            let response = self.handle_request(&request).await;
            transport.send(&serde_json::to_string(&response)?).await?;
        }

        tracing::debug!(server = %self.server_name, "Transport closed, shutting down");
        Ok(())
    }

    /// Handle a single JSON-RPC request and produce a response.
    pub async fn handle_request(&mut self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(&request.params).await,
            method => {
                tracing::debug!(method = %method, "Unsupported method");
                Err(McpError::MethodNotFound(method.to_string()))
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(err) => {
                let rpc = err.to_rpc_error();
                JsonRpcResponse::error(id, rpc.code, rpc.message)
            }
        }
    }

    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => {
                tracing::debug!(server = %self.server_name, "Client confirmed initialization");
            }
            method => {
                tracing::trace!(method = %method, "Ignoring notification");
            }
        }
    }

    fn handle_initialize(&mut self) -> Result<Value, McpError> {
        self.initialized = true;
        to_value(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                ..Default::default()
            },
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: Some(self.server_version.clone()),
            },
        })
    }

    fn handle_list_tools(&self) -> Result<Value, McpError> {
        let tools: Vec<ToolInfo> = self.registry.list().into_iter().map(ToolInfo::from).collect();
        to_value(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn handle_call_tool(&self, params: &Option<Value>) -> Result<Value, McpError> {
        let params = params
            .clone()
            .ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
        let call: CallToolParams =
            serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))?;

        tracing::debug!(tool = %call.name, "Handling tools/call");
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| McpError::ToolNotFound(call.name.clone()))?;

        let ctx = ToolContext {
            working_directory: self.working_directory.clone(),
        };
        let result = match tool.execute(call.arguments, &ctx).await {
            Ok(ToolOutput::Text(text)) => CallToolResult {
                content: vec![ContentItem::Text { text }],
                is_error: false,
            },
            Ok(ToolOutput::Items(content)) => CallToolResult {
                content,
                is_error: false,
            },
            Err(e) => CallToolResult {
                content: vec![ContentItem::Text {
                    text: e.to_string(),
                }],
                is_error: true,
            },
        };
        to_value(result)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, McpError> {
    Ok(serde_json::to_value(value)?)
}

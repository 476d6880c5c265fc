//! Session client for one tool provider.
//!
//! Owns the provider's transport, caches its listings, and recovers from a
//! lost session by reconnecting once. A session that is lost again before
//! any request succeeds stops the client for good.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use switchyard_core::TransportKind;
use switchyard_tool_runtime::{ToolCallResult, ToolDefinition, ToolOutput};

use crate::connector::Connector;
use crate::error::McpError;
use crate::transport::McpTransport;
use crate::types::*;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
    /// Terminal. Every request fails without touching the transport.
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recovering => "recovering",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One live protocol session over one transport.
struct Session {
    transport: Box<dyn McpTransport>,
    next_id: i64,
    server_info: Option<ServerInfo>,
}

impl Session {
    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest::new(RpcId::Number(id), method, params);
        debug!(method = %method, id = %id, "Sending request");
        self.transport.send(&serde_json::to_string(&request)?).await?;

        match tokio::time::timeout(timeout, self.read_response(id)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                method: method.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Read until the response for `id` arrives, skipping anything else the
    /// server sends in between.
    async fn read_response(&mut self, id: i64) -> Result<Value, McpError> {
        loop {
            let Some(line) = self.transport.receive().await? else {
                return Err(McpError::Connection("transport closed".to_string()));
            };
            match IncomingMessage::parse(&line) {
                Ok(IncomingMessage::Response(response)) if response.id == RpcId::Number(id) => {
                    if let Some(err) = response.error {
                        return Err(McpError::from_rpc(err));
                    }
                    return Ok(response.result.unwrap_or(Value::Null));
                }
                Ok(IncomingMessage::Response(response)) => {
                    debug!(id = ?response.id, "Dropping response to an earlier request");
                }
                Ok(IncomingMessage::Notification(notif)) => {
                    trace!(method = %notif.method, "Skipping server notification");
                }
                Ok(IncomingMessage::Request(request)) => {
                    let reply = if request.method == "ping" {
                        JsonRpcResponse::success(request.id, serde_json::json!({}))
                    } else {
                        JsonRpcResponse::error(
                            request.id,
                            error_codes::METHOD_NOT_FOUND,
                            format!("client does not handle '{}'", request.method),
                        )
                    };
                    self.transport.send(&serde_json::to_string(&reply)?).await?;
                }
                Err(e) => warn!(error = %e, "Skipping unparseable message"),
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notif = JsonRpcNotification::new(method, params);
        self.transport.send(&serde_json::to_string(&notif)?).await
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    tools: Option<Vec<ToolDefinition>>,
    prompts: Option<Vec<PromptInfo>>,
    resources: Option<Vec<ResourceInfo>>,
    /// Set by an automatic reconnect, cleared by the next successful request.
    restarted: bool,
}

impl Inner {
    fn clear_caches(&mut self) {
        self.tools = None;
        self.prompts = None;
        self.resources = None;
    }
}

/// A `*/list` result page.
trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ListToolsResult {
    type Item = ToolInfo;
    fn into_parts(self) -> (Vec<ToolInfo>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for ListPromptsResult {
    type Item = PromptInfo;
    fn into_parts(self) -> (Vec<PromptInfo>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

impl Page for ListResourcesResult {
    type Item = ResourceInfo;
    fn into_parts(self) -> (Vec<ResourceInfo>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

/// Session/transport client for one provider.
pub struct McpClient {
    name: String,
    connector: Arc<dyn Connector>,
    request_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl McpClient {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            connector,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.connector.kind()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().and_then(|s| s.server_info.clone())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if state != ConnectionState::Connected {
            inner.clear_caches();
        }
        self.state.send_replace(state);
    }

    /// Establish the transport and perform the initialize handshake.
    /// A no-op when already connected.
    pub async fn start(&self) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            ConnectionState::Connected if inner.session.is_some() => Ok(()),
            ConnectionState::Stopped => Err(McpError::Stopped(self.name.clone())),
            _ => self.connect(&mut inner).await,
        }
    }

    async fn connect(&self, inner: &mut Inner) -> Result<(), McpError> {
        self.set_state(inner, ConnectionState::Connecting);
        match self.open_session().await {
            Ok(session) => {
                let server = session
                    .server_info
                    .as_ref()
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                inner.session = Some(session);
                self.set_state(inner, ConnectionState::Connected);
                info!(provider = %self.name, kind = %self.kind(), server = %server, "MCP client connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(inner, ConnectionState::Disconnected);
                warn!(provider = %self.name, error = %e, "MCP connection failed");
                Err(match e {
                    McpError::Connection(_) => e,
                    other => McpError::Connection(other.to_string()),
                })
            }
        }
    }

    async fn open_session(&self) -> Result<Session, McpError> {
        let transport = self.connector.connect().await?;
        let mut session = Session {
            transport,
            next_id: 1,
            server_info: None,
        };

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "switchyard".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        };
        let result = session
            .request(
                "initialize",
                Some(serde_json::to_value(params)?),
                self.request_timeout,
            )
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        session.server_info = Some(init.server_info);
        session.notify("notifications/initialized", None).await?;
        Ok(session)
    }

    /// Tear down the session and mark the client disconnected.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut session) = inner.session.take() {
            let _ = session.transport.close().await;
        }
        inner.restarted = false;
        if self.state() != ConnectionState::Stopped {
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
        info!(provider = %self.name, "MCP client stopped");
    }

    async fn roundtrip(
        &self,
        inner: &mut Inner,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let session = inner.session.as_mut().ok_or(McpError::NotConnected)?;
        session.request(method, params, self.request_timeout).await
    }

    /// Send one request, recovering from a lost session at most once.
    async fn execute(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            ConnectionState::Stopped => return Err(McpError::Stopped(self.name.clone())),
            ConnectionState::Connected if inner.session.is_some() => {}
            _ => self.connect(&mut inner).await?,
        }

        let err = match self.roundtrip(&mut inner, method, params.clone()).await {
            Ok(value) => {
                inner.restarted = false;
                return Ok(value);
            }
            Err(e) if e.is_session_error() => e,
            Err(e) => return Err(e),
        };

        if inner.restarted {
            return Err(self.stop_permanently(&mut inner, err).await);
        }
        self.recover(&mut inner, &err).await?;

        match self.roundtrip(&mut inner, method, params).await {
            Ok(value) => {
                inner.restarted = false;
                Ok(value)
            }
            Err(e) if e.is_session_error() => Err(self.stop_permanently(&mut inner, e).await),
            Err(e) => Err(e),
        }
    }

    async fn recover(&self, inner: &mut Inner, cause: &McpError) -> Result<(), McpError> {
        warn!(provider = %self.name, error = %cause, "MCP session lost, reconnecting");
        self.set_state(inner, ConnectionState::Recovering);
        if let Some(mut session) = inner.session.take() {
            let _ = session.transport.close().await;
        }
        inner.restarted = true;

        match self.open_session().await {
            Ok(session) => {
                inner.session = Some(session);
                self.set_state(inner, ConnectionState::Connected);
                info!(provider = %self.name, "MCP session re-established");
                Ok(())
            }
            Err(e) => {
                self.set_state(inner, ConnectionState::Disconnected);
                warn!(provider = %self.name, error = %e, "MCP reconnect failed");
                Err(McpError::Connection(e.to_string()))
            }
        }
    }

    async fn stop_permanently(&self, inner: &mut Inner, cause: McpError) -> McpError {
        error!(
            provider = %self.name,
            error = %cause,
            "MCP session lost again after restart, stopping provider"
        );
        if let Some(mut session) = inner.session.take() {
            let _ = session.transport.close().await;
        }
        self.set_state(inner, ConnectionState::Stopped);
        McpError::Stopped(self.name.clone())
    }

    async fn fetch_all<P: Page>(&self, method: &str) -> Result<Vec<P::Item>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .take()
                .map(|c| serde_json::to_value(ListParams { cursor: Some(c) }))
                .transpose()?;
            let page: P = serde_json::from_value(self.execute(method, params).await?)?;
            let (page_items, next) = page.into_parts();
            items.extend(page_items);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
    }

    /// Fetch a listing, treating an unsupported capability as empty.
    async fn fetch_or_empty<P: Page>(&self, method: &str) -> Result<Vec<P::Item>, McpError> {
        match self.fetch_all::<P>(method).await {
            Err(McpError::MethodNotFound(_)) => {
                debug!(provider = %self.name, method, "capability not supported, caching empty list");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        if let Some(tools) = self.inner.lock().await.tools.clone() {
            return Ok(tools);
        }
        let tools: Vec<ToolDefinition> = self
            .fetch_or_empty::<ListToolsResult>("tools/list")
            .await?
            .into_iter()
            .map(ToolDefinition::from)
            .collect();
        debug!(provider = %self.name, count = tools.len(), "tools listed");
        let mut inner = self.inner.lock().await;
        if self.state() == ConnectionState::Connected {
            inner.tools = Some(tools.clone());
        }
        Ok(tools)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>, McpError> {
        if let Some(prompts) = self.inner.lock().await.prompts.clone() {
            return Ok(prompts);
        }
        let prompts = self.fetch_or_empty::<ListPromptsResult>("prompts/list").await?;
        let mut inner = self.inner.lock().await;
        if self.state() == ConnectionState::Connected {
            inner.prompts = Some(prompts.clone());
        }
        Ok(prompts)
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, McpError> {
        if let Some(resources) = self.inner.lock().await.resources.clone() {
            return Ok(resources);
        }
        let resources = self
            .fetch_or_empty::<ListResourcesResult>("resources/list")
            .await?;
        let mut inner = self.inner.lock().await;
        if self.state() == ConnectionState::Connected {
            inner.resources = Some(resources.clone());
        }
        Ok(resources)
    }

    /// Invoke a tool by the name this provider knows it by.
    pub async fn call_tool(
        &self,
        call_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let raw = self.execute("tools/call", Some(params)).await?;
        let result: CallToolResult = serde_json::from_value(raw.clone())?;

        let mut output = ToolCallResult::success(call_id, ToolOutput::Items(result.content), Some(raw));
        output.is_error = result.is_error;
        Ok(output)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let params = serde_json::to_value(GetPromptParams {
            name: name.to_string(),
            arguments,
        })?;
        let raw = self.execute("prompts/get", Some(params)).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let params = serde_json::to_value(ReadResourceParams {
            uri: uri.to_string(),
        })?;
        let raw = self.execute("resources/read", Some(params)).await?;
        Ok(serde_json::from_value(raw)?)
    }
}

//! Shared fixtures: in-process tool providers and event collection.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use switchyard_core::{
    PermissionType, ProviderConfig, RuntimeConfig, TransportKind, TransportParams,
};
use switchyard_mcp::{
    error_codes, ChannelTransport, Connector, IncomingMessage, JsonRpcResponse, McpError,
    McpTransport, PROTOCOL_VERSION,
};
use switchyard_orchestrator::{ConnectorFactory, Orchestrator, TurnEvent};
use switchyard_tool_runtime::{
    Tool, ToolContext, ToolDefinition, ToolError, ToolOutput, ToolRegistry,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Tool that answers with a fixed string and counts its invocations.
pub struct CountingTool {
    name: String,
    reply: String,
    pub calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: reply.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("{} tool", self.name),
            input_schema: json!({"type": "object"}),
        }
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::Text(self.reply.clone()))
    }
}

/// Invocation counters for the standard fixture providers.
pub struct Counters {
    pub fs_search: Arc<AtomicUsize>,
    pub fs_write: Arc<AtomicUsize>,
    pub web_search: Arc<AtomicUsize>,
    pub db_query: Arc<AtomicUsize>,
}

fn in_process(builtin: &str) -> ProviderConfig {
    ProviderConfig::new(TransportParams::InProcess {
        builtin: builtin.to_string(),
    })
}

/// Config with three providers: `fs` (search, write_file), `web` (search)
/// and `db` (query). Every provider auto-approves reads only.
pub fn fixture_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    for name in ["fs", "web", "db"] {
        config.providers.insert(
            name.to_string(),
            in_process(name).with_auto_approve(&[PermissionType::Read]),
        );
    }
    config
}

/// Build (but do not start) an orchestrator serving the fixture providers.
pub fn fixture_with(config: RuntimeConfig) -> (Orchestrator, Counters) {
    let fs_search = CountingTool::new("search", "fs hit: notes.txt");
    let fs_write = CountingTool::new("write_file", "written");
    let web_search = CountingTool::new("search", "web hit: example.com");
    let db_query = CountingTool::new("query", "3 rows");
    let counters = Counters {
        fs_search: fs_search.calls.clone(),
        fs_write: fs_write.calls.clone(),
        web_search: web_search.calls.clone(),
        db_query: db_query.calls.clone(),
    };

    let mut fs = ToolRegistry::new();
    fs.register(fs_search).unwrap();
    fs.register(fs_write).unwrap();
    let mut web = ToolRegistry::new();
    web.register(web_search).unwrap();
    let mut db = ToolRegistry::new();
    db.register(db_query).unwrap();

    let orchestrator = Orchestrator::builder(config)
        .with_builtin("fs", fs)
        .with_builtin("web", web)
        .with_builtin("db", db)
        .build();
    (orchestrator, counters)
}

/// Fixture orchestrator with every provider started.
pub async fn started_fixture() -> (Orchestrator, Counters) {
    let (orchestrator, counters) = fixture_with(fixture_config());
    let failures = orchestrator.start_providers().await;
    assert!(failures.is_empty(), "providers failed to start: {failures:?}");
    (orchestrator, counters)
}

/// Drain a turn's events until the channel closes.
pub async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(TIMEOUT, rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return events,
            Err(_) => panic!("turn did not finish, events so far: {events:?}"),
        }
    }
}

/// Wait for the first event matching `pred`.
pub async fn wait_for(
    rx: &mut mpsc::Receiver<TurnEvent>,
    pred: impl Fn(&TurnEvent) -> bool,
) -> TurnEvent {
    loop {
        match tokio::time::timeout(TIMEOUT, rx.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_)) => {}
            Ok(None) => panic!("stream closed before the expected event"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

pub fn count(events: &[TurnEvent], pred: impl Fn(&TurnEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

pub fn last_is_end(events: &[TurnEvent], cancelled: bool) -> bool {
    matches!(events.last(), Some(TurnEvent::End { cancelled: c }) if *c == cancelled)
}

// ── Scripted remote provider ────────────────────────────────────────

/// State shared by every connection the remote fake accepts.
pub struct Remote {
    pub connects: AtomicUsize,
    /// `tools/list` requests answered
    pub listings: AtomicUsize,
    /// Upcoming `tools/call` requests that fail with a lost session
    pub session_failures: AtomicUsize,
    /// Tool names the server currently advertises
    pub tools: Mutex<Vec<String>>,
}

impl Remote {
    pub fn new(session_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            session_failures: AtomicUsize::new(session_failures),
            tools: Mutex::new(vec!["find_record".to_string()]),
        })
    }

    pub fn fail_next_calls(&self, count: usize) {
        self.session_failures.store(count, Ordering::SeqCst);
    }

    fn tool_list(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .lock()
            .unwrap()
            .iter()
            .map(|name| json!({"name": name, "description": "Look up a record", "inputSchema": {"type": "object"}}))
            .collect();
        json!({ "tools": tools })
    }
}

async fn serve(remote: Arc<Remote>, mut transport: ChannelTransport) {
    while let Ok(Some(line)) = transport.receive().await {
        let Ok(IncomingMessage::Request(request)) = IncomingMessage::parse(&line) else {
            continue;
        };
        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "remote"}
                }),
            ),
            "tools/list" => {
                remote.listings.fetch_add(1, Ordering::SeqCst);
                JsonRpcResponse::success(request.id, remote.tool_list())
            }
            "tools/call" => {
                let failing = remote
                    .session_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    JsonRpcResponse::error(request.id, -32001, "Session not found")
                } else {
                    JsonRpcResponse::success(
                        request.id,
                        json!({"content": [{"type": "text", "text": "record 7"}]}),
                    )
                }
            }
            _ => JsonRpcResponse::error(request.id, error_codes::METHOD_NOT_FOUND, "nope"),
        };
        let Ok(line) = serde_json::to_string(&response) else {
            return;
        };
        if transport.send(&line).await.is_err() {
            return;
        }
    }
}

struct RemoteConnector {
    remote: Arc<Remote>,
}

#[async_trait]
impl Connector for RemoteConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> Result<Box<dyn McpTransport>, McpError> {
        self.remote.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = ChannelTransport::pair();
        tokio::spawn(serve(self.remote.clone(), server));
        Ok(Box::new(client))
    }
}

struct RemoteFactory {
    remote: Arc<Remote>,
}

impl ConnectorFactory for RemoteFactory {
    fn connector(
        &self,
        _name: &str,
        _config: &ProviderConfig,
        _npm_registry: Option<String>,
    ) -> Arc<dyn Connector> {
        Arc::new(RemoteConnector {
            remote: self.remote.clone(),
        })
    }
}

/// Orchestrator with one started http provider, `remote`, backed by the
/// scripted server. Reads are auto-approved.
pub async fn remote_orchestrator(session_failures: usize) -> (Orchestrator, Arc<Remote>) {
    let remote = Remote::new(session_failures);

    let mut config = RuntimeConfig::default();
    config.providers.insert(
        "remote".to_string(),
        ProviderConfig::new(TransportParams::Http {
            url: "http://records.internal/mcp".to_string(),
            headers: Default::default(),
        })
        .with_auto_approve(&[PermissionType::Read]),
    );
    let orchestrator = Orchestrator::builder(config)
        .with_connector_factory(Arc::new(RemoteFactory {
            remote: remote.clone(),
        }))
        .build();
    orchestrator.start_provider("remote").await.unwrap();
    (orchestrator, remote)
}

//! Turns provider transport configuration into live transports.
//!
//! A session client owns a `Connector` rather than a transport so it can
//! tear a broken session down and dial a fresh one.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{TransportKind, TransportParams};
use switchyard_tool_runtime::ToolRegistry;

use crate::error::McpError;
use crate::server::McpServer;
use crate::transport::{
    ChildProcessTransport, McpTransport, SseTransport, StreamableHttpTransport,
};

const NPM_REGISTRY_VAR: &str = "npm_config_registry";

#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> Result<Box<dyn McpTransport>, McpError>;
}

/// Tool registries that can be served in-process, by builtin name.
#[derive(Default, Clone)]
pub struct BuiltinServers {
    servers: HashMap<String, Arc<ToolRegistry>>,
}

impl BuiltinServers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, registry: ToolRegistry) {
        self.servers.insert(name.into(), Arc::new(registry));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolRegistry>> {
        self.servers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Connector driven by a provider's `TransportParams`.
pub struct ConfigConnector {
    provider: String,
    params: TransportParams,
    builtins: Arc<BuiltinServers>,
    npm_registry: Option<String>,
    connect_timeout: Duration,
}

impl ConfigConnector {
    pub fn new(provider: impl Into<String>, params: TransportParams, builtins: Arc<BuiltinServers>) -> Self {
        Self {
            provider: provider.into(),
            params,
            builtins,
            npm_registry: None,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Package registry to hand to `npx`-launched servers.
    pub fn with_npm_registry(mut self, registry: Option<String>) -> Self {
        self.npm_registry = registry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Environment for a stdio server, with the package registry injected for
/// `npx` launches unless the provider already set one.
pub fn stdio_env(
    command: &str,
    env: &BTreeMap<String, String>,
    npm_registry: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = env.clone();
    let is_npx = Path::new(command)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.eq_ignore_ascii_case("npx"));
    if let Some(registry) = npm_registry {
        if is_npx && !env.contains_key(NPM_REGISTRY_VAR) {
            env.insert(NPM_REGISTRY_VAR.to_string(), registry.to_string());
        }
    }
    env
}

#[async_trait]
impl Connector for ConfigConnector {
    fn kind(&self) -> TransportKind {
        self.params.kind()
    }

    async fn connect(&self) -> Result<Box<dyn McpTransport>, McpError> {
        tracing::debug!(provider = %self.provider, kind = %self.kind(), "connecting transport");
        match &self.params {
            TransportParams::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let env = stdio_env(command, env, self.npm_registry.as_deref());
                let transport = ChildProcessTransport::spawn(command, args, &env, cwd.as_deref())?;
                Ok(Box::new(transport))
            }
            TransportParams::Sse { url, headers } => {
                let transport = SseTransport::connect(url, headers, self.connect_timeout).await?;
                Ok(Box::new(transport))
            }
            TransportParams::Http { url, headers } => {
                Ok(Box::new(StreamableHttpTransport::new(url, headers)?))
            }
            TransportParams::InProcess { builtin } => {
                let registry = self.builtins.get(builtin).ok_or_else(|| {
                    McpError::Connection(format!("unknown builtin server '{builtin}'"))
                })?;
                let server = McpServer::new(registry).with_name(builtin.clone());
                Ok(Box::new(server.spawn_in_process()))
            }
        }
    }
}

//! Provider lifecycle: the authoritative set of live session clients.
//!
//! Every start, stop, eviction or configuration change bumps a generation
//! counter. The tool catalog compares generations to know when its cached
//! listing is stale.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use switchyard_core::{ProviderConfig, TransportKind, TransportParams};
use switchyard_mcp::{BuiltinServers, ConfigConnector, ConnectionState, Connector, McpClient};

use crate::error::OrchestratorError;
use crate::mirror::MirrorSelector;

/// Builds the connector a new session client dials through.
pub trait ConnectorFactory: Send + Sync {
    fn connector(
        &self,
        name: &str,
        config: &ProviderConfig,
        npm_registry: Option<String>,
    ) -> Arc<dyn Connector>;
}

/// Connects according to the provider's transport parameters.
pub struct ConfigConnectorFactory {
    builtins: Arc<BuiltinServers>,
}

impl ConfigConnectorFactory {
    pub fn new(builtins: Arc<BuiltinServers>) -> Self {
        Self { builtins }
    }
}

impl ConnectorFactory for ConfigConnectorFactory {
    fn connector(
        &self,
        name: &str,
        config: &ProviderConfig,
        npm_registry: Option<String>,
    ) -> Arc<dyn Connector> {
        Arc::new(
            ConfigConnector::new(name, config.transport.clone(), self.builtins.clone())
                .with_npm_registry(npm_registry),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: TransportKind,
    pub enabled: bool,
    pub state: ConnectionState,
}

pub struct ProviderRegistry {
    configs: Mutex<BTreeMap<String, ProviderConfig>>,
    clients: Arc<Mutex<HashMap<String, Arc<McpClient>>>>,
    connectors: Arc<dyn ConnectorFactory>,
    mirror: Arc<MirrorSelector>,
    generation: Arc<AtomicU64>,
    /// Serializes start/stop so two callers never race to connect one provider
    lifecycle: tokio::sync::Mutex<()>,
}

impl ProviderRegistry {
    pub fn new(
        configs: BTreeMap<String, ProviderConfig>,
        connectors: Arc<dyn ConnectorFactory>,
        mirror: Arc<MirrorSelector>,
    ) -> Self {
        Self {
            configs: Mutex::new(configs),
            clients: Arc::new(Mutex::new(HashMap::new())),
            connectors,
            mirror,
            generation: Arc::new(AtomicU64::new(0)),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Current generation. Changes whenever the set of live clients or the
    /// configuration changes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mirror(&self) -> &Arc<MirrorSelector> {
        &self.mirror
    }

    pub fn config(&self, name: &str) -> Option<ProviderConfig> {
        self.configs.lock().unwrap().get(name).cloned()
    }

    pub fn configs(&self) -> BTreeMap<String, ProviderConfig> {
        self.configs.lock().unwrap().clone()
    }

    /// Start a provider by name. Starting a running provider does nothing.
    pub async fn start(&self, name: &str) -> Result<(), OrchestratorError> {
        let _guard = self.lifecycle.lock().await;

        if let Some(existing) = self.client(name) {
            if existing.state() != ConnectionState::Stopped {
                debug!(provider = name, "provider already running");
                return Ok(());
            }
            self.clients.lock().unwrap().remove(name);
        }

        let config = self
            .config(name)
            .ok_or_else(|| OrchestratorError::UnknownProvider(name.to_string()))?;
        config
            .transport
            .validate(name)
            .map_err(|e| OrchestratorError::InvalidProviderConfig {
                provider: name.to_string(),
                reason: e.to_string(),
            })?;

        let npm_registry = if launches_npx(&config.transport) {
            Some(self.mirror.select(false).await.registry)
        } else {
            None
        };

        let connector = self.connectors.connector(name, &config, npm_registry);
        let client = Arc::new(McpClient::new(name, connector));
        client.start().await?;

        self.watch_for_permanent_stop(name, &client);
        self.clients
            .lock()
            .unwrap()
            .insert(name.to_string(), client);
        self.invalidate();
        info!(provider = name, kind = %config.transport.kind(), "provider started");
        Ok(())
    }

    /// Stop a provider by name. Stopping an unknown provider does nothing.
    pub async fn stop(&self, name: &str) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(name).await;
    }

    async fn stop_locked(&self, name: &str) {
        let removed = self.clients.lock().unwrap().remove(name);
        if let Some(client) = removed {
            client.stop().await;
            self.invalidate();
            info!(provider = name, "provider stopped");
        }
    }

    /// Start every enabled provider. Failures are logged and returned; they
    /// never prevent the remaining providers from starting.
    pub async fn start_enabled(&self) -> Vec<(String, OrchestratorError)> {
        let enabled: Vec<String> = self
            .configs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.clone())
            .collect();

        let mut failures = Vec::new();
        for name in enabled {
            if let Err(e) = self.start(&name).await {
                warn!(provider = %name, error = %e, "provider failed to start");
                failures.push((name, e));
            }
        }
        failures
    }

    pub async fn stop_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let names: Vec<String> = self.clients.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.stop_locked(&name).await;
        }
    }

    /// Replace the provider configuration. Running providers that were
    /// removed, or whose transport changed, are stopped. Returns the names
    /// of the providers that were stopped.
    pub async fn update_config(&self, configs: BTreeMap<String, ProviderConfig>) -> Vec<String> {
        let _guard = self.lifecycle.lock().await;

        let running: Vec<String> = self.clients.lock().unwrap().keys().cloned().collect();
        let mut stopped = Vec::new();
        for name in running {
            let unchanged = {
                let current = self.configs.lock().unwrap();
                match (current.get(&name), configs.get(&name)) {
                    (Some(old), Some(new)) => old.transport == new.transport && new.enabled,
                    _ => false,
                }
            };
            if !unchanged {
                self.stop_locked(&name).await;
                stopped.push(name);
            }
        }

        *self.configs.lock().unwrap() = configs;
        self.invalidate();
        info!(stopped = stopped.len(), "provider configuration updated");
        stopped
    }

    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.lock().unwrap().get(name).cloned()
    }

    /// Live clients in provider-name order. Catalog builds iterate this, so
    /// the order decides which provider claims a name first.
    pub fn running_clients(&self) -> Vec<(String, Arc<McpClient>)> {
        let mut clients: Vec<_> = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, client)| client.state() != ConnectionState::Stopped)
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients
    }

    /// Every configured provider plus any running one, by name.
    pub fn status(&self) -> Vec<ProviderStatus> {
        let configs = self.configs.lock().unwrap();
        let clients = self.clients.lock().unwrap();

        let mut statuses: Vec<ProviderStatus> = configs
            .iter()
            .map(|(name, config)| ProviderStatus {
                name: name.clone(),
                kind: config.transport.kind(),
                enabled: config.enabled,
                state: clients
                    .get(name)
                    .map(|c| c.state())
                    .unwrap_or(ConnectionState::Disconnected),
            })
            .collect();
        for (name, client) in clients.iter() {
            if !configs.contains_key(name) {
                statuses.push(ProviderStatus {
                    name: name.clone(),
                    kind: client.kind(),
                    enabled: false,
                    state: client.state(),
                });
            }
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Evict the client once it stops for good, so the next catalog build
    /// no longer sees it.
    fn watch_for_permanent_stop(&self, name: &str, client: &Arc<McpClient>) {
        let mut states = client.subscribe();
        let watched = Arc::downgrade(client);
        let clients = self.clients.clone();
        let generation = self.generation.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                if *states.borrow_and_update() != ConnectionState::Stopped {
                    continue;
                }
                let mut live = clients.lock().unwrap();
                let is_current = live
                    .get(&name)
                    .is_some_and(|current| Arc::as_ptr(current) == watched.as_ptr());
                if is_current {
                    live.remove(&name);
                    generation.fetch_add(1, Ordering::SeqCst);
                    warn!(provider = %name, "provider stopped permanently, evicted");
                }
                break;
            }
        });
    }
}

fn launches_npx(transport: &TransportParams) -> bool {
    match transport {
        TransportParams::Stdio { command, .. } => Path::new(command)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.eq_ignore_ascii_case("npx")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::MirrorSettings;
    use switchyard_tool_runtime::tool::EchoTool;
    use switchyard_tool_runtime::ToolRegistry;

    fn in_process(builtin: &str) -> ProviderConfig {
        ProviderConfig::new(TransportParams::InProcess {
            builtin: builtin.to_string(),
        })
    }

    fn registry(configs: &[(&str, ProviderConfig)]) -> ProviderRegistry {
        let mut builtins = BuiltinServers::new();
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool).unwrap();
        builtins.register("echo", tools);

        ProviderRegistry::new(
            configs
                .iter()
                .map(|(name, config)| (name.to_string(), config.clone()))
                .collect(),
            Arc::new(ConfigConnectorFactory::new(Arc::new(builtins))),
            Arc::new(MirrorSelector::new(MirrorSettings::default())),
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let registry = registry(&[("tools", in_process("echo"))]);
        let before = registry.generation();

        registry.start("tools").await.unwrap();
        let first = registry.client("tools").unwrap();
        registry.start("tools").await.unwrap();
        assert!(Arc::ptr_eq(&first, &registry.client("tools").unwrap()));
        assert!(registry.generation() > before);

        registry.stop("tools").await;
        registry.stop("tools").await;
        registry.stop("never-configured").await;
        assert!(registry.client("tools").is_none());
        assert_eq!(first.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unknown_provider_cannot_start() {
        let registry = registry(&[]);
        assert!(matches!(
            registry.start("ghost").await,
            Err(OrchestratorError::UnknownProvider(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn start_enabled_skips_disabled_and_reports_failures() {
        let mut disabled = in_process("echo");
        disabled.enabled = false;
        let registry = registry(&[
            ("broken", in_process("missing")),
            ("off", disabled),
            ("tools", in_process("echo")),
        ]);

        let failures = registry.start_enabled().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");

        let running: Vec<_> = registry.running_clients().into_iter().map(|(n, _)| n).collect();
        assert_eq!(running, vec!["tools"]);

        let status = registry.status();
        assert_eq!(status.len(), 3);
        assert_eq!(status[1].name, "off");
        assert_eq!(status[1].state, ConnectionState::Disconnected);
        assert_eq!(status[2].state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn config_update_stops_removed_and_changed_providers() {
        let registry = registry(&[("a", in_process("echo")), ("b", in_process("echo"))]);
        registry.start("a").await.unwrap();
        registry.start("b").await.unwrap();

        let mut next = BTreeMap::new();
        next.insert("a".to_string(), in_process("echo"));
        let stopped = registry.update_config(next).await;

        assert_eq!(stopped, vec!["b".to_string()]);
        assert!(registry.client("a").is_some());
        assert!(registry.client("b").is_none());
    }

    #[tokio::test]
    async fn running_client_calls_through() {
        let registry = registry(&[("tools", in_process("echo"))]);
        registry.start("tools").await.unwrap();
        let client = registry.client("tools").unwrap();
        let result = client
            .call_tool("c1", "echo", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.content.to_text(), "hi");
    }

    #[test]
    fn only_npx_launches_get_a_mirror() {
        let npx = TransportParams::Stdio {
            command: "/usr/bin/npx".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        };
        let uvx = TransportParams::Stdio {
            command: "uvx".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        };
        assert!(launches_npx(&npx));
        assert!(!launches_npx(&uvx));
        assert!(!launches_npx(&TransportParams::InProcess {
            builtin: "echo".to_string()
        }));
    }
}

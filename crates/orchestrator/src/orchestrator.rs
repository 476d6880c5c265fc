//! Caller-facing facade that owns and wires every runtime component.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

use switchyard_core::{AutoApprovePolicy, PermissionType, RateLimitConfig, RuntimeConfig};
use switchyard_mcp::BuiltinServers;
use switchyard_tool_runtime::{
    ModelAdapter, ModelInfo, PermissionError, PermissionGate, PermissionRequest, PolicyStore,
    RateLimitStatus, RateLimiter, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput,
    ToolRegistry,
};

use crate::catalog::{CatalogSnapshot, ToolCatalog};
use crate::deferred::Deferred;
use crate::engine::{ActiveTurn, AgentLoopEngine, TurnRequest};
use crate::error::OrchestratorError;
use crate::events::TurnEvent;
use crate::mirror::{MirrorSelector, Prober};
use crate::processor::ToolCallProcessor;
use crate::provider_registry::{
    ConfigConnectorFactory, ConnectorFactory, ProviderRegistry, ProviderStatus,
};

/// Name of the in-process server that reports on the runtime itself.
pub const RUNTIME_BUILTIN: &str = "runtime";

/// Built-in tool listing configured providers and their connection state.
struct ListProvidersTool {
    registry: Deferred<ProviderRegistry>,
}

#[async_trait]
impl Tool for ListProvidersTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_providers".to_string(),
            description: "List configured tool providers and their connection state".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let registry = self
            .registry
            .get()
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let status = serde_json::to_string_pretty(&registry.status())
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::Text(status))
    }
}

/// Auto-approve policies read from, and remembered grants written into, the
/// live runtime configuration. `Orchestrator::config()` therefore always
/// carries every remembered grant for the caller to persist.
struct ConfigPolicyStore {
    config: Arc<RwLock<RuntimeConfig>>,
}

#[async_trait]
impl PolicyStore for ConfigPolicyStore {
    async fn policy(&self, provider: &str) -> AutoApprovePolicy {
        self.config
            .read()
            .unwrap()
            .providers
            .get(provider)
            .map(|p| p.policy())
            .unwrap_or_default()
    }

    async fn grant(&self, provider: &str, permission: PermissionType) -> Result<(), PermissionError> {
        let mut config = self.config.write().unwrap();
        let entry = config
            .providers
            .get_mut(provider)
            .ok_or_else(|| PermissionError::Store(format!("unknown provider '{provider}'")))?;
        entry.grant(permission);
        info!(provider, %permission, auto_approve = ?entry.auto_approve, "auto-approve policy updated");
        Ok(())
    }
}

pub struct OrchestratorBuilder {
    config: RuntimeConfig,
    builtins: BuiltinServers,
    connectors: Option<Arc<dyn ConnectorFactory>>,
    prober: Option<Arc<dyn Prober>>,
}

impl OrchestratorBuilder {
    /// Serve `tools` in-process under `name`, for providers configured with
    /// `transport = { kind = "in_process", builtin = name }`.
    pub fn with_builtin(mut self, name: impl Into<String>, tools: ToolRegistry) -> Self {
        self.builtins.register(name, tools);
        self
    }

    pub fn with_connector_factory(mut self, connectors: Arc<dyn ConnectorFactory>) -> Self {
        self.connectors = Some(connectors);
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn build(mut self) -> Orchestrator {
        // The runtime builtin needs the registry, which needs the builtins.
        let registry_handle: Deferred<ProviderRegistry> = Deferred::new("provider registry");
        let mut runtime_tools = ToolRegistry::new();
        if let Err(e) = runtime_tools.register(ListProvidersTool {
            registry: registry_handle.clone(),
        }) {
            warn!(error = %e, "runtime builtin tool not registered");
        }
        self.builtins.register(RUNTIME_BUILTIN, runtime_tools);
        let builtins = Arc::new(self.builtins);

        let config = Arc::new(RwLock::new(self.config.clone()));
        let gate = Arc::new(PermissionGate::new(Arc::new(ConfigPolicyStore {
            config: config.clone(),
        })));
        let rate_limiter = RateLimiter::from_config(&self.config.rate_limits);

        let mirror = Arc::new(match self.prober {
            Some(prober) => MirrorSelector::with_prober(self.config.mirror.clone(), prober),
            None => MirrorSelector::new(self.config.mirror.clone()),
        });
        let connectors: Arc<dyn ConnectorFactory> = match self.connectors {
            Some(connectors) => connectors,
            None => Arc::new(ConfigConnectorFactory::new(builtins.clone())),
        };
        let registry = Arc::new(ProviderRegistry::new(
            self.config.providers.clone(),
            connectors,
            mirror,
        ));
        registry_handle.set(registry.clone());

        let catalog = Arc::new(ToolCatalog::new(registry.clone()));
        let processor = Arc::new(ToolCallProcessor::new(
            catalog.clone(),
            registry.clone(),
            gate.clone(),
        ));
        let engine = Arc::new(AgentLoopEngine::new(
            catalog.clone(),
            processor,
            rate_limiter.clone(),
            self.config.runtime.clone(),
        ));

        Orchestrator {
            config,
            gate,
            rate_limiter,
            registry,
            catalog,
            engine,
        }
    }
}

/// One runtime instance. All shared state lives here, not in globals.
pub struct Orchestrator {
    config: Arc<RwLock<RuntimeConfig>>,
    gate: Arc<PermissionGate>,
    rate_limiter: RateLimiter,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<ToolCatalog>,
    engine: Arc<AgentLoopEngine>,
}

impl Orchestrator {
    pub fn builder(config: RuntimeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            builtins: BuiltinServers::new(),
            connectors: None,
            prober: None,
        }
    }

    pub fn new(config: RuntimeConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config.read().unwrap().clone()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn register_adapter(&self, provider_id: impl Into<String>, adapter: Arc<dyn ModelAdapter>) {
        self.engine.register_adapter(provider_id, adapter);
    }

    /// Start every enabled tool provider. Returns the providers that failed.
    pub async fn start_providers(&self) -> Vec<(String, OrchestratorError)> {
        self.registry.start_enabled().await
    }

    pub async fn start_provider(&self, name: &str) -> Result<(), OrchestratorError> {
        self.registry.start(name).await
    }

    pub async fn stop_provider(&self, name: &str) {
        self.registry.stop(name).await;
    }

    pub async fn shutdown(&self) {
        self.registry.stop_all().await;
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.registry.status()
    }

    pub async fn tool_catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.snapshot().await
    }

    pub fn start_turn(
        &self,
        request: TurnRequest,
    ) -> Result<mpsc::Receiver<TurnEvent>, OrchestratorError> {
        self.engine.start_turn(request)
    }

    pub fn cancel(&self, event_id: &str) -> bool {
        self.engine.cancel(event_id)
    }

    pub fn active_turns(&self) -> Vec<ActiveTurn> {
        self.engine.active_turns()
    }

    /// Resolve a pending request. The turn holding the call resumes: an
    /// approval runs it, a denial is reported to the model. Remembered grants
    /// are written into the runtime configuration.
    pub async fn resolve_permission(
        &self,
        request_id: &str,
        granted: bool,
        remember: bool,
    ) -> Result<PermissionRequest, OrchestratorError> {
        Ok(self.gate.resolve(request_id, granted, remember).await?)
    }

    pub fn pending_permissions(&self) -> Vec<PermissionRequest> {
        self.gate.pending()
    }

    pub fn clear_session_grants(&self) {
        self.gate.clear_session_grants();
    }

    /// Status for one model provider, or all of them.
    pub fn rate_limit_status(&self, provider_id: Option<&str>) -> Vec<RateLimitStatus> {
        match provider_id {
            Some(provider) => self.rate_limiter.status(provider).into_iter().collect(),
            None => self.rate_limiter.status_all(),
        }
    }

    pub fn set_rate_limit(
        &self,
        provider_id: &str,
        config: RateLimitConfig,
    ) -> Result<(), OrchestratorError> {
        self.rate_limiter.set_config(provider_id, config)?;
        self.config
            .write()
            .unwrap()
            .rate_limits
            .insert(provider_id.to_string(), config);
        Ok(())
    }

    pub async fn list_models(&self, provider_id: &str) -> Result<Vec<ModelInfo>, OrchestratorError> {
        let adapter = self
            .engine
            .adapter(provider_id)
            .ok_or_else(|| OrchestratorError::UnknownAdapter(provider_id.to_string()))?;
        let lister = adapter
            .model_lister()
            .ok_or_else(|| OrchestratorError::CapabilityNotSupported(provider_id.to_string()))?;
        Ok(lister.list_models().await?)
    }

    /// Apply a new configuration: providers, auto-approve policies and rate
    /// limits. Runtime limits take effect for orchestrators built afterwards.
    ///
    /// The new configuration replaces the old one wholesale, policies
    /// included; start from `config()` to keep remembered grants.
    pub async fn update_config(&self, config: RuntimeConfig) -> Result<(), OrchestratorError> {
        config.validate()?;

        let removed: Vec<String> = self
            .config
            .read()
            .unwrap()
            .rate_limits
            .keys()
            .filter(|name| !config.rate_limits.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            self.rate_limiter.remove_provider(&name);
        }
        for (name, limit) in &config.rate_limits {
            self.rate_limiter.set_config(name, *limit)?;
        }

        let stopped = self.registry.update_config(config.providers.clone()).await;
        self.catalog.invalidate();
        info!(stopped = ?stopped, "runtime configuration applied");
        *self.config.write().unwrap() = config;
        Ok(())
    }
}

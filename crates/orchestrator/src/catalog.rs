//! Cross-provider tool catalog.
//!
//! Flattens every running provider's tool listing into one namespace. Names
//! claimed by more than one provider are renamed to `{provider}_{name}` on
//! every provider that exposes them; names outside the allowed identifier
//! pattern are dropped.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info, warn};

use regex::Regex;
use switchyard_tool_runtime::ToolDefinition;

use crate::provider_registry::ProviderRegistry;

fn tool_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("valid tool name pattern"))
}

pub fn is_valid_tool_name(name: &str) -> bool {
    tool_name_pattern().is_match(name)
}

/// A tool as the model sees it, plus where it really lives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalTool {
    pub canonical_name: String,
    pub original_name: String,
    pub provider: String,
    pub description: String,
    pub input_schema: Value,
    /// Renamed because another provider exposes the same name
    pub renamed: bool,
}

impl CanonicalTool {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.canonical_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingFailure {
    pub provider: String,
    pub error: String,
}

/// One fully built catalog. Readers only ever see complete snapshots.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    tools: Vec<CanonicalTool>,
    by_name: HashMap<String, usize>,
    failures: Vec<ListingFailure>,
}

impl CatalogSnapshot {
    /// Build from per-provider listings, in the order given.
    pub fn build(
        generation: u64,
        listings: Vec<(String, Result<Vec<ToolDefinition>, String>)>,
    ) -> Self {
        let mut failures = Vec::new();
        let mut listed = Vec::new();
        for (provider, listing) in listings {
            match listing {
                Ok(tools) => listed.push((provider, tools)),
                Err(error) => {
                    warn!(provider = %provider, error = %error, "tool listing failed, provider skipped");
                    failures.push(ListingFailure { provider, error });
                }
            }
        }

        // Pass 1: find names claimed by more than one provider.
        let mut first_seen: HashMap<&str, &str> = HashMap::new();
        let mut conflicted: HashSet<(&str, &str)> = HashSet::new();
        for (provider, tools) in &listed {
            for tool in tools {
                match first_seen.get(tool.name.as_str()) {
                    None => {
                        first_seen.insert(tool.name.as_str(), provider.as_str());
                    }
                    Some(owner) if *owner != provider.as_str() => {
                        conflicted.insert((*owner, tool.name.as_str()));
                        conflicted.insert((provider.as_str(), tool.name.as_str()));
                    }
                    Some(_) => {}
                }
            }
        }

        // Pass 2: assign canonical names.
        let mut snapshot = CatalogSnapshot {
            generation,
            failures,
            ..Default::default()
        };
        for (provider, tools) in &listed {
            for tool in tools {
                let renamed = conflicted.contains(&(provider.as_str(), tool.name.as_str()));
                let (canonical_name, description) = if renamed {
                    (
                        format!("{provider}_{}", tool.name),
                        format!("[{provider}] {}", tool.description),
                    )
                } else {
                    (tool.name.clone(), tool.description.clone())
                };

                if !is_valid_tool_name(&canonical_name) {
                    warn!(provider = %provider, tool = %canonical_name, "invalid tool name, dropped");
                    continue;
                }
                if snapshot.by_name.contains_key(&canonical_name) {
                    warn!(provider = %provider, tool = %canonical_name, "duplicate tool name, dropped");
                    continue;
                }

                snapshot
                    .by_name
                    .insert(canonical_name.clone(), snapshot.tools.len());
                snapshot.tools.push(CanonicalTool {
                    canonical_name,
                    original_name: tool.name.clone(),
                    provider: provider.clone(),
                    description,
                    input_schema: tool.input_schema.clone(),
                    renamed,
                });
            }
        }
        snapshot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tools(&self) -> &[CanonicalTool] {
        &self.tools
    }

    pub fn get(&self, canonical_name: &str) -> Option<&CanonicalTool> {
        self.by_name.get(canonical_name).map(|i| &self.tools[*i])
    }

    pub fn failures(&self) -> &[ListingFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Lazily rebuilt view over the provider registry.
pub struct ToolCatalog {
    registry: Arc<ProviderRegistry>,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    build: tokio::sync::Mutex<()>,
}

impl ToolCatalog {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            current: RwLock::new(None),
            build: tokio::sync::Mutex::new(()),
        }
    }

    /// Drop the cached snapshot; the next reader rebuilds.
    pub fn invalidate(&self) {
        *self.current.write().unwrap() = None;
    }

    fn fresh(&self) -> Option<Arc<CatalogSnapshot>> {
        let generation = self.registry.generation();
        self.current
            .read()
            .unwrap()
            .as_ref()
            .filter(|s| s.generation == generation)
            .cloned()
    }

    /// The current catalog, rebuilt if the registry changed since the last
    /// build.
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        if let Some(snapshot) = self.fresh() {
            return snapshot;
        }
        let _building = self.build.lock().await;
        if let Some(snapshot) = self.fresh() {
            return snapshot;
        }
        self.rebuild_locked().await
    }

    /// Rebuild unconditionally.
    pub async fn rebuild(&self) -> Arc<CatalogSnapshot> {
        let _building = self.build.lock().await;
        self.rebuild_locked().await
    }

    async fn rebuild_locked(&self) -> Arc<CatalogSnapshot> {
        let generation = self.registry.generation();
        let mut listings = Vec::new();
        for (name, client) in self.registry.running_clients() {
            let listing = client.list_tools().await.map_err(|e| e.to_string());
            listings.push((name, listing));
        }

        let snapshot = Arc::new(CatalogSnapshot::build(generation, listings));
        info!(
            tools = snapshot.len(),
            skipped = snapshot.failures.len(),
            generation,
            "tool catalog rebuilt"
        );
        *self.current.write().unwrap() = Some(snapshot.clone());
        snapshot
    }

    /// Tools whose canonical or original name is in `enabled`; all tools
    /// when `enabled` is `None`.
    pub async fn tools(&self, enabled: Option<&HashSet<String>>) -> Vec<CanonicalTool> {
        let snapshot = self.snapshot().await;
        snapshot
            .tools()
            .iter()
            .filter(|tool| {
                enabled.map_or(true, |names| {
                    names.contains(&tool.canonical_name) || names.contains(&tool.original_name)
                })
            })
            .cloned()
            .collect()
    }

    /// Resolve a canonical name. A miss forces exactly one rebuild before
    /// the tool is reported absent.
    pub async fn resolve(&self, canonical_name: &str) -> Option<CanonicalTool> {
        if let Some(tool) = self.snapshot().await.get(canonical_name) {
            return Some(tool.clone());
        }
        debug!(tool = canonical_name, "catalog miss, rebuilding once");
        self.rebuild().await.get(canonical_name).cloned()
    }
}

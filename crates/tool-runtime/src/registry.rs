use crate::tool::{Tool, ToolDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The tool set of one built-in provider.
///
/// Served to the orchestrator over an in-process transport, so built-in
/// tools go through the same session path as external providers.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Returns error if name already registered.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let def = tool.definition();
        if self.tools.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        self.tools.insert(def.name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All tool definitions, ordered by name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool with name '{0}' is already registered")]
    DuplicateName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{EchoTool, ToolContext, ToolError, ToolOutput};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct ListDirectory;

    #[async_trait]
    impl Tool for ListDirectory {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "list_directory".to_string(),
                description: "List a directory".to_string(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Text("a.txt".to_string()))
        }
    }

    #[test]
    fn lookup_by_provider_local_name() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry.register_arc(Arc::new(ListDirectory)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("list_directory").is_some());
        assert!(registry.get("fs_list_directory").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        assert!(matches!(
            registry.register(EchoTool),
            Err(RegistryError::DuplicateName(name)) if name == "echo"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn listing_is_ordered_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(ListDirectory).unwrap();
        registry.register(EchoTool).unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "list_directory"]);
    }
}

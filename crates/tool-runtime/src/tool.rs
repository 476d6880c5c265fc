use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::permission::PermissionRequest;

/// Describes a tool's interface for LLM consumption.
/// Maps to Claude's tool format and OpenAI's function format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within its provider; globally unique once canonicalized)
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
}

/// Represents an LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation (used to match results)
    pub id: String,
    /// Canonical tool name to execute
    pub name: String,
    /// JSON input arguments
    pub input: Value,
}

/// A single content block returned by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedResource,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Tool output: plain text or structured content items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Text(String),
    Items(Vec<ContentItem>),
}

impl ToolOutput {
    /// Flatten to text for encodings that only carry strings.
    pub fn to_text(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Items(items) => items
                .iter()
                .map(|item| match item {
                    ContentItem::Text { text } => text.clone(),
                    ContentItem::Image { mime_type, .. } => format!("[image: {mime_type}]"),
                    ContentItem::Resource { resource } => resource
                        .text
                        .clone()
                        .unwrap_or_else(|| format!("[resource: {}]", resource.uri)),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text(text)
    }
}

/// Result of dispatching one tool call, sent back into the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Must match the ToolCall id
    pub id: String,
    pub content: ToolOutput,
    /// Untouched provider response, when there was one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    pub is_error: bool,
    /// Set when execution was held back pending user approval
    #[serde(default)]
    pub requires_permission: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_request: Option<PermissionRequest>,
}

impl ToolCallResult {
    pub fn success(id: impl Into<String>, content: ToolOutput, raw: Option<Value>) -> Self {
        Self {
            id: id.into(),
            content,
            raw,
            is_error: false,
            requires_permission: false,
            permission_request: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: ToolOutput::Text(message.into()),
            raw: None,
            is_error: true,
            requires_permission: false,
            permission_request: None,
        }
    }

    pub fn permission_required(id: impl Into<String>, request: PermissionRequest) -> Self {
        Self {
            id: id.into(),
            content: ToolOutput::Text(format!(
                "'{}' on provider '{}' needs {} permission",
                request.tool_name, request.provider, request.permission_type
            )),
            raw: None,
            is_error: false,
            requires_permission: true,
            permission_request: Some(request),
        }
    }
}

/// Context passed to tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Working directory for file/bash operations
    pub working_directory: std::path::PathBuf,
}

/// The primary extension point for built-in tools served in-process.
///
/// Tools are object-safe, Send + Sync, and async.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's definition (name, description, JSON Schema).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// Simple echo tool for testing purposes.
#[cfg(any(test, feature = "test-utils"))]
pub struct EchoTool;

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes back the input message. For testing.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                },
                "required": ["message"]
            }),
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let message = input
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'message' field".to_string()))?;

        Ok(ToolOutput::Text(message.to_string()))
    }
}

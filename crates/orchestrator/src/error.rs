use switchyard_core::ConfigError;
use switchyard_mcp::McpError;
use switchyard_tool_runtime::{LlmError, PermissionError, RateLimitError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Unknown tool provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid configuration for provider '{provider}': {reason}")]
    InvalidProviderConfig { provider: String, reason: String },

    #[error("Too many concurrent streams (limit {0})")]
    TooManyStreams(usize),

    #[error("A turn with event id '{0}' is already running")]
    DuplicateTurn(String),

    #[error("No model adapter registered for '{0}'")]
    UnknownAdapter(String),

    #[error("Model provider '{0}' does not support listing models")]
    CapabilityNotSupported(String),

    #[error("{0} is not ready yet")]
    NotReady(&'static str),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),
}

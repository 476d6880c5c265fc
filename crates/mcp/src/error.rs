//! Error types for the MCP crate.

use crate::types::{error_codes, JsonRpcError};

/// Transport failure texts that mean the server no longer knows our session.
const SESSION_ERROR_PATTERNS: &[&str] = &[
    "session not found",
    "no valid session",
    "session expired",
    "invalid session",
    "error posting to endpoint (http 400)",
];

/// Errors that can occur during MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Non-success HTTP status from an SSE or streamable HTTP endpoint.
    #[error("Error POSTing to endpoint (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    /// The server answered with a JSON-RPC error.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The requested method is not supported.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters for a method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The requested tool was not found in the registry.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The transport could not be established. Not retried automatically.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server dropped our session. Recoverable once per connection.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The connection was stopped after repeated session failures.
    #[error("Provider '{0}' is stopped after repeated session failures")]
    Stopped(String),

    /// No live session; `start` has not been called or the client was stopped.
    #[error("Not connected")]
    NotConnected,

    /// No response within the request timeout.
    #[error("Request '{method}' timed out after {secs}s")]
    Timeout { method: String, secs: u64 },
}

impl McpError {
    /// Whether this failure means the server lost our session, which a fresh
    /// connection can fix.
    pub fn is_session_error(&self) -> bool {
        match self {
            McpError::SessionExpired(_) => true,
            McpError::Http { status, body } => {
                let text = self.to_string().to_lowercase();
                let body = body.to_lowercase();
                SESSION_ERROR_PATTERNS.iter().any(|p| text.contains(p))
                    || (*status == 400 && body.contains("bad request"))
                    || SESSION_ERROR_PATTERNS.iter().any(|p| body.contains(p))
            }
            McpError::Rpc { message, .. } | McpError::Connection(message) => {
                let message = message.to_lowercase();
                SESSION_ERROR_PATTERNS.iter().any(|p| message.contains(p))
            }
            McpError::Transport(e) => {
                let message = e.to_string().to_lowercase();
                SESSION_ERROR_PATTERNS.iter().any(|p| message.contains(p))
            }
            _ => false,
        }
    }

    /// Map a JSON-RPC error object from the server.
    pub fn from_rpc(error: JsonRpcError) -> Self {
        if error.code == error_codes::METHOD_NOT_FOUND {
            McpError::MethodNotFound(error.message)
        } else {
            McpError::Rpc {
                code: error.code,
                message: error.message,
            }
        }
    }

    /// Convert to a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let (code, message) = match self {
            McpError::JsonParse(_) => (error_codes::PARSE_ERROR, self.to_string()),
            McpError::MethodNotFound(_) => (error_codes::METHOD_NOT_FOUND, self.to_string()),
            McpError::InvalidParams(_) => (error_codes::INVALID_PARAMS, self.to_string()),
            McpError::ToolNotFound(_) => (error_codes::INVALID_PARAMS, self.to_string()),
            McpError::Rpc { code, message } => (*code, message.clone()),
            _ => (error_codes::INTERNAL_ERROR, self.to_string()),
        };
        JsonRpcError {
            code,
            message,
            data: None,
        }
    }
}

//! MCP (Model Context Protocol) plumbing for switchyard.
//!
//! Implements the tool-provider side of the runtime over JSON-RPC 2.0.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 and MCP-specific protocol types
//! - **transport**: child-process, SSE, streamable HTTP and in-process channel bindings
//! - **connector**: builds transports from provider configuration
//! - **client**: per-provider session client with listing caches and session recovery
//! - **server**: in-process server wrapping a `ToolRegistry` for built-in providers
//! - **error**: unified error type and session-error detection
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchyard_core::TransportParams;
//! use switchyard_mcp::{BuiltinServers, ConfigConnector, McpClient};
//!
//! # async fn example() -> Result<(), switchyard_mcp::McpError> {
//! let connector = ConfigConnector::new(
//!     "fs",
//!     TransportParams::Stdio {
//!         command: "npx".to_string(),
//!         args: vec!["-y".to_string(), "@modelcontextprotocol/server-filesystem".to_string()],
//!         env: Default::default(),
//!         cwd: None,
//!     },
//!     Arc::new(BuiltinServers::new()),
//! );
//! let client = McpClient::new("fs", Arc::new(connector));
//! client.start().await?;
//! let tools = client.list_tools().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connector;
pub mod error;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{ConnectionState, McpClient};
pub use connector::{BuiltinServers, ConfigConnector, Connector};
pub use error::McpError;
pub use server::McpServer;
pub use transport::{
    ChannelTransport, ChildProcessTransport, McpTransport, SseTransport, StreamableHttpTransport,
};
pub use types::*;

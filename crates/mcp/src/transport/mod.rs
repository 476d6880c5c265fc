//! MCP transport layer.
//!
//! `McpTransport` moves whole JSON-RPC messages. Framing is the binding's
//! business: newline-delimited JSON for child processes, SSE `message`
//! events, HTTP bodies, or channel messages in-process.

use async_trait::async_trait;

use crate::error::McpError;

mod channel;
mod child;
mod http;
mod sse;

pub use channel::ChannelTransport;
pub use child::ChildProcessTransport;
pub use http::StreamableHttpTransport;
pub use sse::{SseEvent, SseParser, SseTransport};

/// Trait for MCP message transport.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Read the next JSON-RPC message from the transport.
    /// Returns `None` when the transport is closed.
    async fn receive(&mut self) -> Result<Option<String>, McpError>;

    /// Write one JSON-RPC message to the transport.
    async fn send(&mut self, message: &str) -> Result<(), McpError>;

    /// Release the underlying connection or process.
    async fn close(&mut self) -> Result<(), McpError> {
        Ok(())
    }
}

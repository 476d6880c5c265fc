use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::collections::{BTreeMap, VecDeque};
use url::Url;

use super::sse::{header_map, SseParser};
use super::McpTransport;
use crate::error::McpError;

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP binding: every message is a POST; the reply body is either
/// a JSON message (or batch) or an SSE stream of messages. The session id the
/// server hands out is replayed on every later request.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Option<String>,
    pending: VecDeque<String>,
}

impl StreamableHttpTransport {
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Result<Self, McpError> {
        Ok(Self {
            client: reqwest::Client::new(),
            url: Url::parse(url).map_err(|e| McpError::Connection(format!("bad url: {e}")))?,
            headers: header_map(headers)?,
            session_id: None,
            pending: VecDeque::new(),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn queue_json_body(&mut self, body: &str) -> Result<(), McpError> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<serde_json::Value>(body)? {
            serde_json::Value::Array(batch) => {
                for message in batch {
                    self.pending.push_back(message.to_string());
                }
            }
            _ => self.pending.push_back(body.to_string()),
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    /// Replies are collected while sending, so this never waits on the network.
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.pending.pop_front())
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(message.to_string());
        if let Some(session) = &self.session_id {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session) {
                tracing::debug!(session, "MCP session established");
                self.session_id = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if is_sse {
            let mut parser = SseParser::new();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| McpError::Connection(e.to_string()))?;
                for event in parser.feed(&chunk) {
                    if event.event == "message" {
                        self.pending.push_back(event.data);
                    }
                }
            }
            if let Some(event) = parser.finish() {
                if event.event == "message" {
                    self.pending.push_back(event.data);
                }
            }
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| McpError::Connection(e.to_string()))?;
            self.queue_json_body(&body)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        // Best effort: tell the server the session is over.
        if let Some(session) = self.session_id.take() {
            let _ = self
                .client
                .delete(self.url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
        }
        self.pending.clear();
        Ok(())
    }
}

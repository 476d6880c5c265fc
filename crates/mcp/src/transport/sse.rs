//! Server-sent-events framing and the SSE transport binding.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use super::McpTransport;
use crate::error::McpError;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the stream did not name one
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser. Bytes may arrive split anywhere, including inside
/// a multi-byte character, so raw bytes are buffered and only complete lines
/// are decoded. Events are dispatched on a blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw[..newline_pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => trace!(field, "ignoring SSE field"),
            }
        }
        events
    }

    /// Dispatch whatever is pending when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let mut rest = std::mem::take(&mut self.buffer);
            rest.push(b'\n');
            if let Some(event) = self.feed(&rest).pop() {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

pub(super) fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Connection(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Connection(format!("invalid value for header '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// SSE binding: a long-lived GET stream delivers responses as `message`
/// events, and requests are POSTed to the URL announced by the first
/// `endpoint` event.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    incoming: mpsc::Receiver<String>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    pub async fn connect(
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        let base = Url::parse(url).map_err(|e| McpError::Connection(format!("bad url: {e}")))?;
        let headers = header_map(headers)?;
        let client = reqwest::Client::new();

        let response = client
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Connection(format!(
                "SSE stream returned HTTP {}",
                status.as_u16()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let (message_tx, incoming) = mpsc::channel(64);
        let mut bytes = response.bytes_stream();

        let reader = tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut endpoint_tx = Some(endpoint_tx);
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "SSE stream failed");
                        break;
                    }
                };
                for event in parser.feed(&chunk) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        "message" => {
                            if message_tx.send(event.data).await.is_err() {
                                return;
                            }
                        }
                        other => trace!(event = other, "ignoring SSE event"),
                    }
                }
            }
            debug!("SSE stream ended");
        });

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(path)) => base
                .join(&path)
                .map_err(|e| McpError::Connection(format!("bad endpoint '{path}': {e}")))?,
            Ok(Err(_)) => {
                return Err(McpError::Connection(
                    "SSE stream closed before announcing an endpoint".to_string(),
                ))
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::Connection(
                    "no endpoint event on SSE stream".to_string(),
                ));
            }
        };
        debug!(endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            client,
            endpoint,
            headers,
            incoming,
            reader,
        })
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.incoming.recv().await)
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.reader.abort();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

//! Bridge adapter: wraps a `SimpleLlmProvider` into a `ModelAdapter`.
//!
//! `SimpleLlmProvider` is a minimal non-streaming completion interface for
//! backends with no structured tool channel. Tools are described in the
//! system prompt and the model asks for them with inline
//! `<function_call>{"name": ..., "arguments": {...}}</function_call>` blocks,
//! which the bridge turns back into canonical tool-call events.

use async_trait::async_trait;
use futures::stream;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::conversation::ConversationMessage;
use crate::provider::{CompletionRequest, EventStream, LlmError, ModelAdapter};
use crate::stream::{StopReason, StreamEvent};
use crate::tool::ToolDefinition;

const CALL_OPEN: &str = "<function_call>";
const CALL_CLOSE: &str = "</function_call>";

/// A simple chat message for non-streaming LLM providers.
#[derive(Debug, Clone)]
pub struct SimpleMessage {
    pub role: SimpleRole,
    pub content: String,
}

/// Role in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimpleRole {
    System,
    User,
    Assistant,
}

/// Error type for `SimpleLlmProvider` operations.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BridgeError(pub String);

/// Minimal non-streaming LLM provider trait.
#[async_trait]
pub trait SimpleLlmProvider: Send + Sync {
    /// Send a chat completion request and return the assistant's response text.
    async fn complete(
        &self,
        messages: Vec<SimpleMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, BridgeError>;
}

/// Inline record of a tool call, as the bridge expects models to write it.
pub fn format_function_call(name: &str, arguments: &Value) -> String {
    let body = serde_json::json!({ "name": name, "arguments": arguments });
    format!("{CALL_OPEN}{body}{CALL_CLOSE}")
}

/// Inline record of a tool result for models without a tool role.
pub fn format_function_result(name: &str, content: &str, is_error: bool) -> String {
    if is_error {
        format!("<function_result name=\"{name}\" error=\"true\">{content}</function_result>")
    } else {
        format!("<function_result name=\"{name}\">{content}</function_result>")
    }
}

/// Follow-up instruction appended after inline tool results.
pub const CONTINUE_PROMPT: &str =
    "Above are the results of the function calls. Continue with the task using these results.";

/// Wraps a `SimpleLlmProvider` into a `ModelAdapter`.
///
/// Reports no native tool support, so tool results come back to it as text.
pub struct LlmProviderBridge {
    inner: Box<dyn SimpleLlmProvider>,
    name: String,
}

impl LlmProviderBridge {
    /// Create a bridge from any `SimpleLlmProvider`.
    pub fn new(inner: Box<dyn SimpleLlmProvider>, name: String) -> Self {
        Self { inner, name }
    }
}

fn tool_prompt(tools: &[ToolDefinition]) -> String {
    let mut prompt = String::from(
        "You can call the following functions. To call one, reply with a block of the form\n",
    );
    prompt.push_str(CALL_OPEN);
    prompt.push_str(r#"{"name": "<function name>", "arguments": {...}}"#);
    prompt.push_str(CALL_CLOSE);
    prompt.push_str("\n\nAvailable functions:\n");
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.input_schema
        ));
    }
    prompt
}

fn to_simple_messages(request: &CompletionRequest) -> Vec<SimpleMessage> {
    let mut messages = Vec::new();

    let mut system = request.system_prompt.clone().unwrap_or_default();
    if !request.tools.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&tool_prompt(&request.tools));
    }
    if !system.is_empty() {
        messages.push(SimpleMessage {
            role: SimpleRole::System,
            content: system,
        });
    }

    for msg in &request.messages {
        match msg {
            ConversationMessage::System(text) => messages.push(SimpleMessage {
                role: SimpleRole::System,
                content: text.clone(),
            }),
            ConversationMessage::User(text) => messages.push(SimpleMessage {
                role: SimpleRole::User,
                content: text.clone(),
            }),
            ConversationMessage::Assistant(content) => {
                let mut text = content.text.clone().unwrap_or_default();
                for call in &content.tool_calls {
                    if !text.contains(CALL_OPEN) {
                        text.push_str(&format_function_call(&call.name, &call.input));
                    }
                }
                if !text.is_empty() {
                    messages.push(SimpleMessage {
                        role: SimpleRole::Assistant,
                        content: text,
                    });
                }
            }
            ConversationMessage::ToolResult(result) => messages.push(SimpleMessage {
                role: SimpleRole::User,
                content: format!("[Tool Result: {}]", result.content),
            }),
        }
    }
    messages
}

#[derive(Deserialize)]
struct FunctionCallBlock {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Split a reply into text and tool-call events.
///
/// Blocks that fail to parse stay in the text so nothing the model wrote is lost.
pub fn parse_reply(reply: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let mut text = String::new();
    let mut rest = reply;
    let mut calls = 0usize;

    while let Some(start) = rest.find(CALL_OPEN) {
        let after_open = &rest[start + CALL_OPEN.len()..];
        let Some(end) = after_open.find(CALL_CLOSE) else {
            break;
        };
        text.push_str(&rest[..start]);
        let body = after_open[..end].trim();
        match serde_json::from_str::<FunctionCallBlock>(body) {
            Ok(block) => {
                calls += 1;
                let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                let args = if block.arguments.is_null() {
                    "{}".to_string()
                } else {
                    block.arguments.to_string()
                };
                events.push(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: block.name,
                });
                events.push(StreamEvent::ToolCallEnd {
                    id,
                    complete_args: Some(args),
                });
            }
            Err(e) => {
                warn!(error = %e, "unparseable function_call block left as text");
                text.push_str(&rest[start..start + CALL_OPEN.len() + end + CALL_CLOSE.len()]);
            }
        }
        rest = &after_open[end + CALL_CLOSE.len()..];
    }
    text.push_str(rest);

    let text = text.trim();
    if !text.is_empty() {
        events.insert(
            0,
            StreamEvent::Text {
                content: text.to_string(),
            },
        );
    }
    events.push(StreamEvent::Stop {
        reason: if calls > 0 {
            StopReason::ToolUse
        } else {
            StopReason::Complete
        },
    });
    events
}

#[async_trait]
impl ModelAdapter for LlmProviderBridge {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<EventStream, LlmError> {
        let messages = to_simple_messages(&request);
        debug!(
            provider = %self.name,
            model = %request.model,
            messages = messages.len(),
            tools = request.tools.len(),
            "bridged completion"
        );

        let response = self
            .inner
            .complete(messages, request.temperature, request.max_tokens)
            .await
            .map_err(|e| LlmError::Other(anyhow::anyhow!("{}", e.0)))?;

        let events: Vec<Result<StreamEvent, LlmError>> =
            parse_reply(&response).into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn supports_native_tools(&self, _model: &str) -> bool {
        false
    }
}

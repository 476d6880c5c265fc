use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical events produced by a model adapter for one completion.
/// Provider-agnostic; vendor formats are translated in the adapter layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of assistant text
    Text { content: String },
    /// A chunk of model reasoning
    Reasoning { content: String },
    /// Start of a tool call (LLM wants to execute a tool)
    ToolCallStart { id: String, name: String },
    /// Incremental JSON argument data for a tool call
    ToolCallChunk { id: String, args_fragment: String },
    /// Tool call arguments are complete. `complete_args` wins over the
    /// accumulated chunks when the adapter supplies it.
    ToolCallEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        complete_args: Option<String>,
    },
    /// Adapter-originated permission prompt, forwarded untouched
    Permission { details: Value },
    /// Token accounting for this completion
    Usage(Usage),
    /// Generated image
    ImageData { data: String, mime_type: String },
    /// An error occurred during streaming
    Error { message: String },
    /// The completion is over
    Stop { reason: StopReason },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Normal end of response
    Complete,
    /// Model wants to use tools
    ToolUse,
    /// Backend failed mid-response
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

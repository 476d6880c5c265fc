use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use switchyard_tool_runtime::permission::{classify, PermissionType};
use switchyard_tool_runtime::{PermissionRequest, ToolCallResult, Usage};

/// Which tools a turn may see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// No tools are offered
    Disabled,
    /// Only tools classified as reads
    ReadOnly,
    #[default]
    Full,
}

impl ToolMode {
    pub fn allows(&self, original_name: &str) -> bool {
        match self {
            ToolMode::Disabled => false,
            ToolMode::ReadOnly => classify(original_name) == PermissionType::Read,
            ToolMode::Full => true,
        }
    }
}

/// Everything a caller observes while a turn runs, in emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Text { content: String },
    Reasoning { content: String },
    /// A tool call is about to be dispatched
    ToolCall { id: String, name: String, input: Value },
    ToolResult { id: String, name: String, result: ToolCallResult },
    /// Adapter-originated permission prompt, passed through untouched
    Permission { details: Value },
    /// A tool call is waiting on the user; the turn resumes once the
    /// request is resolved
    PermissionRequired { request: PermissionRequest },
    RateLimited {
        provider: String,
        queue_length: usize,
        estimated_wait_ms: u64,
    },
    /// Running usage total for the turn
    Usage(Usage),
    ImageData { data: String, mime_type: String },
    Error { message: String },
    MaxToolCallsReached { limit: usize },
    End { cancelled: bool },
}

/// Sending half of a turn's event channel. A caller that stopped listening
/// is not an error; events are simply dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: TurnEvent) {
        let _ = self.tx.send(event).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

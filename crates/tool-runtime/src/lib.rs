pub mod bridge;
pub mod conversation;
pub mod permission;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod stream;
pub mod tool;

pub use bridge::{BridgeError, LlmProviderBridge, SimpleLlmProvider, SimpleMessage, SimpleRole};
pub use conversation::{AssistantContent, Conversation, ConversationMessage, ToolResultMessage};
pub use permission::{
    InMemoryPolicyStore, PendingApproval, PermissionDecision, PermissionError, PermissionGate,
    PermissionRequest, PermissionResolution, PolicyStore,
};
pub use provider::{CompletionRequest, EventStream, LlmError, ModelAdapter, ModelInfo, ModelLister};
pub use rate_limit::{Admission, QueuedPermit, RateLimitError, RateLimitStatus, RateLimiter};
pub use registry::{RegistryError, ToolRegistry};
pub use stream::{StopReason, StreamEvent, Usage};
pub use tool::{
    ContentItem, EmbeddedResource, Tool, ToolCall, ToolCallResult, ToolContext, ToolDefinition,
    ToolError, ToolOutput,
};

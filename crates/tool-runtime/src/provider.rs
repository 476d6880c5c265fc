use crate::conversation::ConversationMessage;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Everything an adapter needs to produce one streamed completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Contract between the agent loop and one LLM backend.
///
/// Lives here (not next to the vendor clients) because it is defined by the
/// consumer. Vendor adapters translate their wire formats into the canonical
/// [`StreamEvent`] sequence.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Stream a completion with the given tools available.
    async fn stream_completion(&self, request: CompletionRequest) -> Result<EventStream, LlmError>;

    /// Provider name for logging/debugging (e.g., "claude", "openai", "ollama")
    fn provider_name(&self) -> &str;

    /// Whether `model` has a structured tool-calling channel. Models without
    /// one get tool results encoded as text.
    fn supports_native_tools(&self, _model: &str) -> bool {
        true
    }

    /// Optional model-listing capability.
    fn model_lister(&self) -> Option<&dyn ModelLister> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub native_tools: bool,
}

/// Adapters that can enumerate the models they serve.
#[async_trait]
pub trait ModelLister: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    AuthError,
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Mock adapter for testing the agent loop without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::stream::StopReason;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns queued responses in FIFO order, then `fallback` forever.
    pub struct MockLlmProvider {
        responses: Mutex<VecDeque<Vec<Result<StreamEvent, String>>>>,
        fallback: Mutex<Option<Vec<StreamEvent>>>,
        requests: Mutex<Vec<CompletionRequest>>,
        native_tools: bool,
        models: Option<Vec<ModelInfo>>,
    }

    impl MockLlmProvider {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                native_tools: true,
                models: None,
            }
        }

        /// Report no native tool channel, like a text-only model.
        pub fn without_native_tools(mut self) -> Self {
            self.native_tools = false;
            self
        }

        pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
            self.models = Some(models);
            self
        }

        /// Queue a response that will be returned on the next call.
        pub fn queue_response(&self, events: Vec<StreamEvent>) {
            self.responses
                .lock()
                .unwrap()
                .push_back(events.into_iter().map(Ok).collect());
        }

        /// Queue a response whose stream fails after `events`.
        pub fn queue_failure(&self, events: Vec<StreamEvent>, error: &str) {
            let mut items: Vec<Result<StreamEvent, String>> = events.into_iter().map(Ok).collect();
            items.push(Err(error.to_string()));
            self.responses.lock().unwrap().push_back(items);
        }

        /// Queue a simple text response.
        pub fn queue_text(&self, text: &str) {
            self.queue_response(vec![
                StreamEvent::Text {
                    content: text.to_string(),
                },
                StreamEvent::Stop {
                    reason: StopReason::Complete,
                },
            ]);
        }

        /// Queue a single tool call with complete arguments.
        pub fn queue_tool_call(&self, id: &str, name: &str, args: serde_json::Value) {
            self.queue_response(tool_call_events(id, name, args));
        }

        /// Response used once the queue is drained.
        pub fn set_fallback(&self, events: Vec<StreamEvent>) {
            *self.fallback.lock().unwrap() = Some(events);
        }

        /// Requests received so far.
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Default for MockLlmProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Events for one streamed tool call followed by a `tool_use` stop.
    pub fn tool_call_events(id: &str, name: &str, args: serde_json::Value) -> Vec<StreamEvent> {
        let args = args.to_string();
        let mid = (0..=args.len() / 2)
            .rev()
            .find(|i| args.is_char_boundary(*i))
            .unwrap_or(0);
        let (head, tail) = args.split_at(mid);
        vec![
            StreamEvent::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamEvent::ToolCallChunk {
                id: id.to_string(),
                args_fragment: head.to_string(),
            },
            StreamEvent::ToolCallChunk {
                id: id.to_string(),
                args_fragment: tail.to_string(),
            },
            StreamEvent::ToolCallEnd {
                id: id.to_string(),
                complete_args: None,
            },
            StreamEvent::Stop {
                reason: StopReason::ToolUse,
            },
        ]
    }

    #[async_trait]
    impl ModelAdapter for MockLlmProvider {
        async fn stream_completion(
            &self,
            request: CompletionRequest,
        ) -> Result<EventStream, LlmError> {
            self.requests.lock().unwrap().push(request);
            let queued = self.responses.lock().unwrap().pop_front();
            let items = match queued {
                Some(items) => items,
                None => self
                    .fallback
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| {
                        vec![StreamEvent::Stop {
                            reason: StopReason::Complete,
                        }]
                    })
                    .into_iter()
                    .map(Ok)
                    .collect(),
            };
            let items: Vec<Result<StreamEvent, LlmError>> = items
                .into_iter()
                .map(|item| item.map_err(LlmError::StreamError))
                .collect();
            Ok(Box::pin(stream::iter(items)))
        }

        fn provider_name(&self) -> &str {
            "mock"
        }

        fn supports_native_tools(&self, _model: &str) -> bool {
            self.native_tools
        }

        fn model_lister(&self) -> Option<&dyn ModelLister> {
            if self.models.is_some() {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl ModelLister for MockLlmProvider {
        async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
            Ok(self.models.clone().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLlmProvider;
    use super::*;
    use futures::StreamExt;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "mock-1".to_string(),
            messages: vec![],
            system_prompt: None,
            tools: vec![],
            temperature: 0.0,
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn mock_returns_queued_responses_in_order() {
        let provider = MockLlmProvider::new();
        provider.queue_text("first");
        provider.queue_text("second");

        let first: Vec<_> = provider
            .stream_completion(request())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            first[0],
            Ok(StreamEvent::Text { ref content }) if content == "first"
        ));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn capability_lookup_is_explicit() {
        let plain = MockLlmProvider::new();
        assert!(plain.model_lister().is_none());

        let listing = MockLlmProvider::new().with_models(vec![ModelInfo {
            id: "m1".to_string(),
            name: "Model One".to_string(),
            native_tools: true,
        }]);
        let models = listing.model_lister().unwrap().list_models().await.unwrap();
        assert_eq!(models[0].id, "m1");
    }
}

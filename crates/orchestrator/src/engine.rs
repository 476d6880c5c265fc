//! The agent loop: one conversational turn from the first model call to the
//! final `End` event.
//!
//! Flow: rate limit → stream model output → collect tool calls → run them
//! through the processor → fold results back → call the model again, until
//! the model stops asking for tools, the call cap is hit, something halts the
//! turn, or the caller cancels.

use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchyard_core::RuntimeSettings;
use switchyard_tool_runtime::{
    Admission, AssistantContent, CompletionRequest, Conversation, ConversationMessage,
    ModelAdapter, RateLimiter, StopReason, StreamEvent, ToolCall, Usage,
};

use crate::catalog::{CanonicalTool, ToolCatalog};
use crate::error::OrchestratorError;
use crate::events::{EventSink, ToolMode, TurnEvent};
use crate::processor::{BatchContext, ToolCallProcessor};

const EVENT_BUFFER: usize = 64;

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Model provider; selects the adapter and the rate limit
    pub provider_id: String,
    pub model_id: String,
    /// Caller-chosen id used for cancellation
    pub event_id: String,
    pub messages: Vec<ConversationMessage>,
    /// Canonical or original tool names; `None` offers every tool
    pub enabled_tools: Option<HashSet<String>>,
    pub mode: ToolMode,
    pub max_tool_calls: Option<usize>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl TurnRequest {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        event_id: impl Into<String>,
        messages: Vec<ConversationMessage>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            event_id: event_id.into(),
            messages,
            enabled_tools: None,
            mode: ToolMode::Full,
            max_tool_calls: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_mode(mut self, mode: ToolMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_enabled_tools(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enabled_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_tool_calls(mut self, limit: usize) -> Self {
        self.max_tool_calls = Some(limit);
        self
    }
}

/// An in-flight turn.
struct StreamHandle {
    provider_id: String,
    model_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTurn {
    pub event_id: String,
    pub provider_id: String,
    pub model_id: String,
}

type ActiveTable = Arc<Mutex<HashMap<String, StreamHandle>>>;

/// Removes a turn from the active table however the turn ends.
struct ActiveGuard {
    active: ActiveTable,
    event_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.event_id);
        debug!(event_id = %self.event_id, "turn removed from active set");
    }
}

/// A tool call whose arguments are still streaming in.
struct PartialCall {
    id: String,
    name: String,
    args: String,
}

impl PartialCall {
    fn finish(self, complete_args: Option<String>) -> ToolCall {
        let raw = complete_args.unwrap_or(self.args);
        let input = if raw.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(call_id = %self.id, tool = %self.name, error = %e, "unparseable tool arguments");
                serde_json::json!({})
            })
        };
        ToolCall {
            id: self.id,
            name: self.name,
            input,
        }
    }
}

/// What one model call produced.
#[derive(Default)]
struct Round {
    text: String,
    open: Vec<PartialCall>,
    pending: Vec<ToolCall>,
    wants_tools: bool,
    halted: bool,
}

impl Round {
    fn flush_open(&mut self) {
        for partial in std::mem::take(&mut self.open) {
            self.pending.push(partial.finish(None));
        }
    }
}

pub struct AgentLoopEngine {
    adapters: RwLock<HashMap<String, Arc<dyn ModelAdapter>>>,
    catalog: Arc<ToolCatalog>,
    processor: Arc<ToolCallProcessor>,
    rate_limiter: RateLimiter,
    settings: RuntimeSettings,
    active: ActiveTable,
}

impl AgentLoopEngine {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        processor: Arc<ToolCallProcessor>,
        rate_limiter: RateLimiter,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            catalog,
            processor,
            rate_limiter,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register_adapter(&self, provider_id: impl Into<String>, adapter: Arc<dyn ModelAdapter>) {
        let provider_id = provider_id.into();
        info!(provider = %provider_id, adapter = adapter.provider_name(), "model adapter registered");
        self.adapters.write().unwrap().insert(provider_id, adapter);
    }

    pub fn adapter(&self, provider_id: &str) -> Option<Arc<dyn ModelAdapter>> {
        self.adapters.read().unwrap().get(provider_id).cloned()
    }

    pub fn active_turns(&self) -> Vec<ActiveTurn> {
        let mut turns: Vec<_> = self
            .active
            .lock()
            .unwrap()
            .iter()
            .map(|(event_id, handle)| ActiveTurn {
                event_id: event_id.clone(),
                provider_id: handle.provider_id.clone(),
                model_id: handle.model_id.clone(),
            })
            .collect();
        turns.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        turns
    }

    /// Request cancellation of a running turn. Returns false if no turn with
    /// that id is running.
    pub fn cancel(&self, event_id: &str) -> bool {
        match self.active.lock().unwrap().get(event_id) {
            Some(handle) => {
                info!(event_id, "turn cancellation requested");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Start a turn on a background task and return its event stream.
    pub fn start_turn(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> Result<mpsc::Receiver<TurnEvent>, OrchestratorError> {
        let adapter = self
            .adapter(&request.provider_id)
            .ok_or_else(|| OrchestratorError::UnknownAdapter(request.provider_id.clone()))?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&request.event_id) {
                return Err(OrchestratorError::DuplicateTurn(request.event_id));
            }
            if active.len() >= self.settings.max_concurrent_streams {
                return Err(OrchestratorError::TooManyStreams(
                    self.settings.max_concurrent_streams,
                ));
            }
            active.insert(
                request.event_id.clone(),
                StreamHandle {
                    provider_id: request.provider_id.clone(),
                    model_id: request.model_id.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        let guard = ActiveGuard {
            active: self.active.clone(),
            event_id: request.event_id.clone(),
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            let events = EventSink::new(tx);
            engine.run_turn(request, adapter, cancel, &events).await;
            // Leave the active set before the caller sees the stream close.
            drop(guard);
            drop(events);
        });
        Ok(rx)
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        adapter: Arc<dyn ModelAdapter>,
        cancel: CancellationToken,
        events: &EventSink,
    ) {
        let event_id = request.event_id.clone();
        let cap = request.max_tool_calls.unwrap_or(self.settings.max_tool_calls);
        let native_tools = adapter.supports_native_tools(&request.model_id);
        let mut conversation = Conversation::from_messages(request.messages.clone());
        let mut executed = 0usize;
        let mut usage = Usage::default();
        let mut continue_loop = true;
        let mut cap_notified = false;

        info!(
            event_id = %event_id,
            provider = %request.provider_id,
            model = %request.model_id,
            native_tools,
            "turn started"
        );

        while continue_loop && !cancel.is_cancelled() && executed < cap {
            let tools = self.active_tools(&request).await;
            let allowed: HashSet<String> = tools.iter().map(|t| t.canonical_name.clone()).collect();

            match self.wait_for_grant(&request.provider_id, &cancel, events).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    events.emit(TurnEvent::Error { message: e.to_string() }).await;
                    break;
                }
            }

            let completion = CompletionRequest {
                model: request.model_id.clone(),
                messages: conversation.messages().to_vec(),
                system_prompt: conversation.system_prompt().map(String::from),
                tools: tools.iter().map(CanonicalTool::definition).collect(),
                temperature: request.temperature.unwrap_or(self.settings.temperature),
                max_tokens: request.max_tokens.unwrap_or(self.settings.max_tokens),
            };
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = adapter.stream_completion(completion) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "model stream failed to open");
                    events.emit(TurnEvent::Error { message: e.to_string() }).await;
                    break;
                }
            };

            let mut round = Round::default();
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = stream.next() => item,
                };
                match item {
                    None => break,
                    Some(Ok(event)) => {
                        self.consume(event, &mut round, &mut usage, events).await;
                    }
                    Some(Err(e)) => {
                        warn!(event_id = %event_id, error = %e, "model stream failed");
                        events.emit(TurnEvent::Error { message: e.to_string() }).await;
                        round.halted = true;
                        break;
                    }
                }
            }

            continue_loop = round.wants_tools && !round.halted && !round.pending.is_empty();

            let text = (!round.text.is_empty()).then(|| round.text.clone());
            let declared = if continue_loop && native_tools {
                round.pending.clone()
            } else {
                Vec::new()
            };
            if text.is_some() || !declared.is_empty() {
                conversation.add_assistant_response(AssistantContent {
                    text,
                    tool_calls: declared,
                });
            }

            if cancel.is_cancelled() || !continue_loop {
                break;
            }

            debug!(event_id = %event_id, calls = round.pending.len(), "dispatching tool calls");
            let batch = self
                .processor
                .process(
                    &round.pending,
                    &mut conversation,
                    &mut executed,
                    BatchContext {
                        native_tools,
                        max_tool_calls: cap,
                        allowed: &allowed,
                        cancel: &cancel,
                    },
                    events,
                )
                .await;
            continue_loop = batch.continue_loop;
            cap_notified |= batch.cap_reached;

            if continue_loop && executed >= cap && !cap_notified {
                info!(event_id = %event_id, limit = cap, "tool call limit reached");
                events.emit(TurnEvent::MaxToolCallsReached { limit: cap }).await;
                cap_notified = true;
            }
        }

        let cancelled = cancel.is_cancelled();
        if !cancelled {
            events.emit(TurnEvent::Usage(usage)).await;
        }
        events.emit(TurnEvent::End { cancelled }).await;
        info!(event_id = %event_id, executed, cancelled, "turn finished");
    }

    async fn consume(&self, event: StreamEvent, round: &mut Round, usage: &mut Usage, events: &EventSink) {
        match event {
            StreamEvent::Text { content } => {
                round.text.push_str(&content);
                events.emit(TurnEvent::Text { content }).await;
            }
            StreamEvent::Reasoning { content } => {
                events.emit(TurnEvent::Reasoning { content }).await;
            }
            StreamEvent::ToolCallStart { id, name } => {
                round.open.push(PartialCall {
                    id,
                    name,
                    args: String::new(),
                });
            }
            StreamEvent::ToolCallChunk { id, args_fragment } => {
                match round.open.iter_mut().find(|p| p.id == id) {
                    Some(partial) => partial.args.push_str(&args_fragment),
                    None => debug!(call_id = %id, "chunk for unknown tool call ignored"),
                }
            }
            StreamEvent::ToolCallEnd { id, complete_args } => {
                match round.open.iter().position(|p| p.id == id) {
                    Some(index) => {
                        let partial = round.open.remove(index);
                        round.pending.push(partial.finish(complete_args));
                    }
                    None => debug!(call_id = %id, "end for unknown tool call ignored"),
                }
            }
            StreamEvent::Permission { details } => {
                round.halted = true;
                events.emit(TurnEvent::Permission { details }).await;
            }
            StreamEvent::Usage(delta) => {
                usage.accumulate(&delta);
                events.emit(TurnEvent::Usage(*usage)).await;
            }
            StreamEvent::ImageData { data, mime_type } => {
                events.emit(TurnEvent::ImageData { data, mime_type }).await;
            }
            StreamEvent::Error { message } => {
                round.halted = true;
                events.emit(TurnEvent::Error { message }).await;
            }
            StreamEvent::Stop { reason } => {
                if reason == StopReason::ToolUse {
                    round.flush_open();
                    round.wants_tools = !round.pending.is_empty();
                }
            }
        }
    }

    /// Catalog ∩ enabled set ∩ mode.
    async fn active_tools(&self, request: &TurnRequest) -> Vec<CanonicalTool> {
        if request.mode == ToolMode::Disabled {
            return Vec::new();
        }
        self.catalog
            .tools(request.enabled_tools.as_ref())
            .await
            .into_iter()
            .filter(|tool| request.mode.allows(&tool.original_name))
            .collect()
    }

    /// Wait for a rate-limit grant. `Ok(false)` means the turn was cancelled
    /// while queued.
    async fn wait_for_grant(
        &self,
        provider_id: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<bool, OrchestratorError> {
        match self.rate_limiter.admit(provider_id) {
            Admission::Granted => Ok(true),
            Admission::Queued(permit) => {
                info!(
                    provider = provider_id,
                    queue_length = permit.queue_length,
                    "model request rate limited"
                );
                events
                    .emit(TurnEvent::RateLimited {
                        provider: provider_id.to_string(),
                        queue_length: permit.queue_length,
                        estimated_wait_ms: permit.estimated_wait.as_millis() as u64,
                    })
                    .await;
                tokio::select! {
                    _ = cancel.cancelled() => Ok(false),
                    granted = permit.wait() => granted.map(|_| true).map_err(Into::into),
                }
            }
        }
    }
}

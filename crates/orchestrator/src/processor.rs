//! Executes one batch of tool calls and folds the results into the
//! conversation.
//!
//! Calls run strictly in the order the model declared them. A call that needs
//! permission holds the batch until the request is resolved: an approval runs
//! it, a denial is reported to the model and ends the batch. A call that fails
//! is reported to the model and the batch moves on.

use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchyard_mcp::McpError;
use switchyard_tool_runtime::bridge::{format_function_call, format_function_result, CONTINUE_PROMPT};
use switchyard_tool_runtime::{
    Conversation, PermissionDecision, PermissionGate, PermissionRequest, PermissionResolution,
    ToolCall, ToolCallResult, ToolResultMessage,
};

use crate::catalog::ToolCatalog;
use crate::events::{EventSink, TurnEvent};
use crate::provider_registry::ProviderRegistry;

/// What happened to one call.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Completed(ToolCallResult),
    /// Held back and abandoned before a decision; nothing was executed
    PermissionRequired(PermissionRequest),
    /// The user refused the call; reported to the model
    Denied(ToolCallResult),
    /// Reported to the model as an error result
    Failed(ToolCallResult),
    /// The owning provider stopped for good; also reported to the model
    Fatal(ToolCallResult),
}

impl ToolOutcome {
    /// The result folded into the conversation, if the call produced one.
    pub fn result(&self) -> Option<&ToolCallResult> {
        match self {
            ToolOutcome::Completed(r)
            | ToolOutcome::Denied(r)
            | ToolOutcome::Failed(r)
            | ToolOutcome::Fatal(r) => Some(r),
            ToolOutcome::PermissionRequired(_) => None,
        }
    }
}

/// Per-turn inputs that shape a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    /// Encode results on the structured tool channel
    pub native_tools: bool,
    pub max_tool_calls: usize,
    /// Canonical names offered to the model this turn
    pub allowed: &'a HashSet<String>,
    /// The turn's token; stops a wait for a permission decision
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub outcomes: Vec<(String, ToolOutcome)>,
    /// Whether the model should be called again
    pub continue_loop: bool,
    pub cap_reached: bool,
}

pub struct ToolCallProcessor {
    catalog: Arc<ToolCatalog>,
    registry: Arc<ProviderRegistry>,
    gate: Arc<PermissionGate>,
}

impl ToolCallProcessor {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        registry: Arc<ProviderRegistry>,
        gate: Arc<PermissionGate>,
    ) -> Self {
        Self {
            catalog,
            registry,
            gate,
        }
    }

    /// Run `calls` in order. `executed` is the turn's call counter; it is
    /// incremented for every call that produced a result.
    pub async fn process(
        &self,
        calls: &[ToolCall],
        conversation: &mut Conversation,
        executed: &mut usize,
        ctx: BatchContext<'_>,
        events: &EventSink,
    ) -> BatchOutcome {
        let mut batch = BatchOutcome {
            continue_loop: true,
            ..Default::default()
        };

        for call in calls {
            if *executed >= ctx.max_tool_calls {
                info!(limit = ctx.max_tool_calls, "tool call limit reached");
                events
                    .emit(TurnEvent::MaxToolCallsReached {
                        limit: ctx.max_tool_calls,
                    })
                    .await;
                batch.cap_reached = true;
                batch.continue_loop = false;
                break;
            }

            let resolved = if ctx.allowed.contains(&call.name) {
                self.catalog.resolve(&call.name).await
            } else {
                None
            };
            let Some(tool) = resolved else {
                warn!(tool = %call.name, "model called an unavailable tool");
                *executed += 1;
                let result = ToolCallResult::error(
                    &call.id,
                    format!("Tool '{}' is not available", call.name),
                );
                encode(conversation, call, &result, ctx.native_tools);
                emit_result(events, call, &result).await;
                batch
                    .outcomes
                    .push((call.id.clone(), ToolOutcome::Failed(result)));
                continue;
            };

            match self
                .gate
                .evaluate(&tool.provider, &tool.original_name, &tool.canonical_name)
                .await
            {
                PermissionDecision::NeedsApproval(mut pending) => {
                    let request = pending.request.clone();
                    events
                        .emit(TurnEvent::PermissionRequired {
                            request: request.clone(),
                        })
                        .await;
                    let resolution = tokio::select! {
                        _ = ctx.cancel.cancelled() => None,
                        resolution = pending.decision() => Some(resolution),
                    };
                    match resolution {
                        Some(PermissionResolution::Approved) => {
                            info!(request_id = %request.id, tool = %call.name, "held tool call approved");
                        }
                        Some(_) => {
                            info!(request_id = %request.id, tool = %call.name, "held tool call denied");
                            *executed += 1;
                            let result = ToolCallResult::error(
                                &call.id,
                                format!("Permission to run tool '{}' was denied", call.name),
                            );
                            encode(conversation, call, &result, ctx.native_tools);
                            emit_result(events, call, &result).await;
                            batch
                                .outcomes
                                .push((call.id.clone(), ToolOutcome::Denied(result)));
                            batch.continue_loop = false;
                            break;
                        }
                        None => {
                            self.gate.withdraw(&request.id);
                            batch
                                .outcomes
                                .push((call.id.clone(), ToolOutcome::PermissionRequired(request)));
                            batch.continue_loop = false;
                            break;
                        }
                    }
                }
                PermissionDecision::Approved(_) => {}
            }

            events
                .emit(TurnEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;
            *executed += 1;

            let outcome = self.dispatch(call, &tool.provider, &tool.original_name).await;
            if let Some(result) = outcome.result() {
                encode(conversation, call, result, ctx.native_tools);
                emit_result(events, call, result).await;
            }
            batch.outcomes.push((call.id.clone(), outcome));
        }

        batch
    }

    async fn dispatch(&self, call: &ToolCall, provider: &str, original_name: &str) -> ToolOutcome {
        let Some(client) = self.registry.client(provider) else {
            return ToolOutcome::Failed(ToolCallResult::error(
                &call.id,
                format!("Tool provider '{provider}' is not running"),
            ));
        };

        debug!(provider, tool = original_name, call_id = %call.id, "dispatching tool call");
        match client.call_tool(&call.id, original_name, call.input.clone()).await {
            Ok(result) if result.is_error => ToolOutcome::Failed(result),
            Ok(result) => ToolOutcome::Completed(result),
            Err(e @ McpError::Stopped(_)) => {
                warn!(provider, tool = original_name, error = %e, "tool provider is stopped");
                ToolOutcome::Fatal(ToolCallResult::error(&call.id, e.to_string()))
            }
            Err(e) => {
                warn!(provider, tool = original_name, error = %e, "tool call failed");
                ToolOutcome::Failed(ToolCallResult::error(
                    &call.id,
                    format!("Error executing tool '{}': {e}", call.name),
                ))
            }
        }
    }
}

async fn emit_result(events: &EventSink, call: &ToolCall, result: &ToolCallResult) {
    events
        .emit(TurnEvent::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            result: result.clone(),
        })
        .await;
}

/// Fold one result into the conversation.
///
/// Native: the call is declared on the latest assistant message and the
/// result travels as a tool-role message keyed by call id. Legacy: call and
/// result are written inline into the assistant's text, followed by a user
/// instruction to carry on.
fn encode(conversation: &mut Conversation, call: &ToolCall, result: &ToolCallResult, native: bool) {
    let content = result.content.to_text();
    if native {
        conversation.declare_tool_call(call);
        conversation.add_tool_result(ToolResultMessage {
            tool_call_id: call.id.clone(),
            content,
            is_error: result.is_error,
        });
    } else {
        let record = format!(
            "{}\n{}",
            format_function_call(&call.name, &call.input),
            format_function_result(&call.name, &content, result.is_error)
        );
        conversation.append_assistant_text(&record);
        conversation.add_user_message(CONTINUE_PROMPT.to_string());
    }
}

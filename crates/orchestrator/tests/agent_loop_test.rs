//! End-to-end agent loop tests: scripted model, in-process tool providers.

mod common;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use switchyard_core::{PermissionType, RateLimitConfig};
use switchyard_orchestrator::{Orchestrator, OrchestratorError, ToolMode, TurnEvent, TurnRequest};
use switchyard_tool_runtime::bridge::CONTINUE_PROMPT;
use switchyard_tool_runtime::provider::mock::{tool_call_events, MockLlmProvider};
use switchyard_tool_runtime::{
    CompletionRequest, ConversationMessage, EventStream, LlmError, ModelAdapter, ModelInfo,
    PermissionRequest, StopReason, StreamEvent, ToolResultMessage,
};

/// Model whose stream never produces anything.
struct HangingAdapter;

#[async_trait]
impl ModelAdapter for HangingAdapter {
    async fn stream_completion(&self, _request: CompletionRequest) -> Result<EventStream, LlmError> {
        Ok(Box::pin(futures::stream::pending::<Result<StreamEvent, LlmError>>()))
    }

    fn provider_name(&self) -> &str {
        "hanging"
    }
}

fn request(event_id: &str) -> TurnRequest {
    TurnRequest::new(
        "mock",
        "mock-1",
        event_id,
        vec![ConversationMessage::User("how many rows?".to_string())],
    )
}

async fn with_mock(mock: MockLlmProvider) -> (Orchestrator, Counters, Arc<MockLlmProvider>) {
    let (orchestrator, counters) = started_fixture().await;
    let mock = Arc::new(mock);
    orchestrator.register_adapter("mock", mock.clone());
    (orchestrator, counters, mock)
}

fn tool_names(request: &CompletionRequest) -> Vec<String> {
    let mut names: Vec<String> = request.tools.iter().map(|t| t.name.clone()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn text_only_turn_ends_cleanly() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_text("No tools needed.");

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    assert!(matches!(&events[0], TurnEvent::Text { content } if content == "No tools needed."));
    assert_eq!(count(&events, |e| matches!(e, TurnEvent::Usage(_))), 1);
    assert!(last_is_end(&events, false));
    assert_eq!(mock.requests().len(), 1);
    assert!(orchestrator.active_turns().is_empty());
}

#[tokio::test]
async fn native_tool_round_feeds_results_back() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "query", json!({"sql": "select count(*) from t"}));
    mock.queue_text("Three rows.");

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::ToolCall { id, name, input } if id == "c1" && name == "query" && input["sql"] == "select count(*) from t"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::ToolResult { id, result, .. } if id == "c1" && result.content.to_text() == "3 rows"
    )));
    assert!(last_is_end(&events, false));
    assert_eq!(counters.db_query.load(Ordering::SeqCst), 1);

    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        tool_names(&requests[0]),
        vec!["fs_search", "query", "web_search", "write_file"]
    );

    let messages = &requests[1].messages;
    assert_eq!(messages.len(), 3);
    match &messages[1] {
        ConversationMessage::Assistant(content) => {
            assert_eq!(content.tool_calls.len(), 1);
            assert_eq!(content.tool_calls[0].id, "c1");
        }
        other => panic!("expected assistant declaration, got {other:?}"),
    }
    assert_eq!(
        messages[2],
        ConversationMessage::ToolResult(ToolResultMessage {
            tool_call_id: "c1".to_string(),
            content: "3 rows".to_string(),
            is_error: false,
        })
    );
}

#[tokio::test]
async fn legacy_models_get_inline_results() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new().without_native_tools()).await;
    mock.queue_tool_call("c1", "query", json!({}));
    mock.queue_text("Three rows.");

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;
    assert!(last_is_end(&events, false));

    let messages = &mock.requests()[1].messages;
    assert_eq!(messages.len(), 3);
    match &messages[1] {
        ConversationMessage::Assistant(content) => {
            assert!(content.tool_calls.is_empty());
            let text = content.text.as_deref().unwrap();
            assert!(text.contains("<function_call"));
            assert!(text.ends_with("<function_result name=\"query\">3 rows</function_result>"));
        }
        other => panic!("expected inline assistant record, got {other:?}"),
    }
    assert_eq!(messages[2], ConversationMessage::User(CONTINUE_PROMPT.to_string()));
}

#[tokio::test]
async fn runaway_model_is_capped() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.set_fallback(tool_call_events("again", "query", json!({})));

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    assert_eq!(count(&events, |e| matches!(e, TurnEvent::ToolCall { .. })), 50);
    assert_eq!(
        count(&events, |e| matches!(e, TurnEvent::MaxToolCallsReached { limit: 50 })),
        1
    );
    assert_eq!(counters.db_query.load(Ordering::SeqCst), 50);
    assert_eq!(mock.requests().len(), 50);
    assert!(last_is_end(&events, false));
}

#[tokio::test]
async fn per_turn_cap_overrides_the_default() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.set_fallback(tool_call_events("again", "query", json!({})));

    let events = collect(
        orchestrator
            .start_turn(request("t1").with_max_tool_calls(3))
            .unwrap(),
    )
    .await;

    assert_eq!(counters.db_query.load(Ordering::SeqCst), 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::MaxToolCallsReached { limit: 3 })));
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "drop_table", json!({}));
    mock.queue_text("That tool does not exist.");

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::ToolResult { id, result, .. }
            if id == "c1" && result.is_error && result.content.to_text().contains("not available")
    )));
    assert_eq!(count(&events, |e| matches!(e, TurnEvent::ToolCall { .. })), 0);
    assert_eq!(mock.requests().len(), 2);
    assert!(last_is_end(&events, false));
}

#[tokio::test]
async fn tools_outside_the_enabled_set_are_not_run() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "web_search", json!({"q": "rust"}));
    mock.queue_text("ok");

    let events = collect(
        orchestrator
            .start_turn(request("t1").with_enabled_tools(["query"]))
            .unwrap(),
    )
    .await;

    assert_eq!(tool_names(&mock.requests()[0]), vec!["query"]);
    assert_eq!(counters.web_search.load(Ordering::SeqCst), 0);
    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::ToolResult { result, .. } if result.is_error
    )));
}

#[tokio::test]
async fn tool_mode_filters_offered_tools() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_text("a");
    mock.queue_text("b");

    collect(
        orchestrator
            .start_turn(request("read-only").with_mode(ToolMode::ReadOnly))
            .unwrap(),
    )
    .await;
    collect(
        orchestrator
            .start_turn(request("disabled").with_mode(ToolMode::Disabled))
            .unwrap(),
    )
    .await;

    let requests = mock.requests();
    assert_eq!(
        tool_names(&requests[0]),
        vec!["fs_search", "query", "web_search"]
    );
    assert!(requests[1].tools.is_empty());
}

async fn held_request(rx: &mut tokio::sync::mpsc::Receiver<TurnEvent>) -> PermissionRequest {
    match wait_for(rx, |e| matches!(e, TurnEvent::PermissionRequired { .. })).await {
        TurnEvent::PermissionRequired { request } => request,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn approved_call_runs_inside_the_same_turn() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "write_file", json!({"path": "notes.txt"}));
    mock.queue_text("Saved.");

    let mut rx = orchestrator.start_turn(request("t1")).unwrap();
    let held = held_request(&mut rx).await;
    assert_eq!(held.tool_name, "write_file");
    assert_eq!(held.provider, "fs");
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.pending_permissions().len(), 1);
    assert_eq!(orchestrator.active_turns().len(), 1);

    orchestrator
        .resolve_permission(&held.id, true, true)
        .await
        .unwrap();
    let rest = collect(rx).await;

    assert!(rest.iter().any(|e| matches!(
        e,
        TurnEvent::ToolCall { id, .. } if id == "c1"
    )));
    assert!(rest.iter().any(|e| matches!(
        e,
        TurnEvent::ToolResult { id, result, .. } if id == "c1" && result.content.to_text() == "written"
    )));
    assert!(rest.iter().any(|e| matches!(e, TurnEvent::Text { content } if content == "Saved.")));
    assert!(last_is_end(&rest, false));
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 1);
    // The model was asked once for the call and once to continue, never again for the tool.
    assert_eq!(mock.requests().len(), 2);
    assert!(orchestrator.pending_permissions().is_empty());
    assert!(orchestrator.active_turns().is_empty());

    mock.queue_tool_call("c2", "write_file", json!({"path": "notes.txt"}));
    mock.queue_text("Saved again.");
    let events = collect(orchestrator.start_turn(request("t2")).unwrap()).await;
    assert_eq!(
        count(&events, |e| matches!(e, TurnEvent::PermissionRequired { .. })),
        0
    );
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn remembered_grant_is_kept_in_the_configuration() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "write_file", json!({}));
    mock.queue_text("done");
    let mut rx = orchestrator.start_turn(request("t1")).unwrap();
    let held = held_request(&mut rx).await;
    orchestrator
        .resolve_permission(&held.id, true, true)
        .await
        .unwrap();
    collect(rx).await;

    let config = orchestrator.config();
    assert_eq!(
        config.providers["fs"].auto_approve,
        vec![PermissionType::Read, PermissionType::Write]
    );
    assert_eq!(config.providers["web"].auto_approve, vec![PermissionType::Read]);

    orchestrator.update_config(config).await.unwrap();
    mock.queue_tool_call("c2", "write_file", json!({}));
    mock.queue_text("done");
    let events = collect(orchestrator.start_turn(request("t2")).unwrap()).await;

    assert_eq!(
        count(&events, |e| matches!(e, TurnEvent::PermissionRequired { .. })),
        0
    );
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn denial_is_reported_and_blocks_only_that_call() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "write_file", json!({}));
    let mut rx = orchestrator.start_turn(request("t1")).unwrap();
    let held = held_request(&mut rx).await;

    orchestrator
        .resolve_permission(&held.id, false, false)
        .await
        .unwrap();
    let rest = collect(rx).await;

    assert!(rest.iter().any(|e| matches!(
        e,
        TurnEvent::ToolResult { id, result, .. } if id == "c1" && result.is_error && result.content.to_text().contains("denied")
    )));
    assert_eq!(count(&rest, |e| matches!(e, TurnEvent::ToolCall { .. })), 0);
    assert!(last_is_end(&rest, false));
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 0);
    assert_eq!(mock.requests().len(), 1);
    assert_eq!(orchestrator.config().providers["fs"].auto_approve, vec![PermissionType::Read]);

    assert!(matches!(
        orchestrator.resolve_permission(&held.id, true, false).await,
        Err(OrchestratorError::Permission(_))
    ));

    // The same call prompts again on the next turn.
    mock.queue_tool_call("c2", "write_file", json!({}));
    let mut rx = orchestrator.start_turn(request("t2")).unwrap();
    held_request(&mut rx).await;
    assert!(orchestrator.cancel("t2"));
    let rest = collect(rx).await;
    assert!(last_is_end(&rest, true));
    assert!(orchestrator.pending_permissions().is_empty());
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_grants_can_be_cleared() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_tool_call("c1", "write_file", json!({}));
    mock.queue_text("done");
    let mut rx = orchestrator.start_turn(request("t1")).unwrap();
    let held = held_request(&mut rx).await;
    orchestrator
        .resolve_permission(&held.id, true, false)
        .await
        .unwrap();
    collect(rx).await;
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.config().providers["fs"].auto_approve, vec![PermissionType::Read]);

    mock.queue_tool_call("c2", "write_file", json!({}));
    mock.queue_text("done");
    collect(orchestrator.start_turn(request("t2")).unwrap()).await;
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 2);

    orchestrator.clear_session_grants();
    mock.queue_tool_call("c3", "write_file", json!({}));
    let mut rx = orchestrator.start_turn(request("t3")).unwrap();
    held_request(&mut rx).await;
    orchestrator.cancel("t3");
    assert!(last_is_end(&collect(rx).await, true));
    assert_eq!(counters.fs_write.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unschedulable_rate_limit_is_rejected() {
    let (orchestrator, _, _) = with_mock(MockLlmProvider::new()).await;
    assert!(matches!(
        orchestrator.set_rate_limit(
            "mock",
            RateLimitConfig {
                enabled: true,
                qps: 1e-30,
            },
        ),
        Err(OrchestratorError::RateLimit(_))
    ));
    assert!(orchestrator.rate_limit_status(Some("mock")).is_empty());
    assert!(!orchestrator.config().rate_limits.contains_key("mock"));
}

#[tokio::test]
async fn stream_failure_ends_the_turn_with_an_error() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new()).await;
    mock.queue_failure(
        vec![StreamEvent::Text {
            content: "partial".to_string(),
        }],
        "connection reset",
    );

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    assert!(matches!(&events[0], TurnEvent::Text { content } if content == "partial"));
    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::Error { message } if message.contains("connection reset")
    )));
    assert!(last_is_end(&events, false));
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn model_error_event_halts_tool_dispatch() {
    let (orchestrator, counters, mock) = with_mock(MockLlmProvider::new()).await;
    let mut response = tool_call_events("c1", "query", json!({}));
    response.insert(
        0,
        StreamEvent::Error {
            message: "content filtered".to_string(),
        },
    );
    mock.queue_response(response);

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Error { message } if message == "content filtered")));
    assert_eq!(counters.db_query.load(Ordering::SeqCst), 0);
    assert!(last_is_end(&events, false));
}

#[tokio::test]
async fn usage_is_accumulated_across_rounds() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new()).await;
    let mut first = tool_call_events("c1", "query", json!({}));
    first.insert(
        0,
        StreamEvent::Usage(switchyard_tool_runtime::Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    );
    mock.queue_response(first);
    mock.queue_response(vec![
        StreamEvent::Usage(switchyard_tool_runtime::Usage {
            prompt_tokens: 20,
            completion_tokens: 7,
            total_tokens: 27,
        }),
        StreamEvent::Stop {
            reason: StopReason::Complete,
        },
    ]);

    let events = collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    let total = events
        .iter()
        .rev()
        .find_map(|e| match e {
            TurnEvent::Usage(usage) => Some(*usage),
            _ => None,
        })
        .unwrap();
    assert_eq!(total.prompt_tokens, 30);
    assert_eq!(total.completion_tokens, 12);
    assert_eq!(total.total_tokens, 42);
}

#[tokio::test]
async fn queued_turn_reports_rate_limit_and_can_be_cancelled() {
    let (orchestrator, _, mock) = with_mock(MockLlmProvider::new()).await;
    orchestrator
        .set_rate_limit(
            "mock",
            RateLimitConfig {
                enabled: true,
                qps: 0.1,
            },
        )
        .unwrap();
    mock.queue_text("first");
    collect(orchestrator.start_turn(request("t1")).unwrap()).await;

    let mut rx = orchestrator.start_turn(request("t2")).unwrap();
    let limited = wait_for(&mut rx, |e| matches!(e, TurnEvent::RateLimited { .. })).await;
    match limited {
        TurnEvent::RateLimited {
            provider,
            queue_length,
            estimated_wait_ms,
        } => {
            assert_eq!(provider, "mock");
            assert_eq!(queue_length, 1);
            assert!(estimated_wait_ms > 0);
        }
        _ => unreachable!(),
    }
    let status = orchestrator.rate_limit_status(Some("mock"));
    assert_eq!(status[0].queue_length, 1);

    assert!(orchestrator.cancel("t2"));
    let rest = collect(rx).await;
    assert!(last_is_end(&rest, true));
    assert_eq!(count(&rest, |e| matches!(e, TurnEvent::Usage(_))), 0);
    assert_eq!(mock.requests().len(), 1);
    assert!(orchestrator.active_turns().is_empty());
}

#[tokio::test]
async fn concurrent_turn_limits() {
    let mut config = fixture_config();
    config.runtime.max_concurrent_streams = 1;
    let (orchestrator, _) = fixture_with(config);
    orchestrator.register_adapter("hang", Arc::new(HangingAdapter));
    orchestrator.register_adapter("mock", Arc::new(MockLlmProvider::new()));

    let hanging = TurnRequest::new("hang", "slow-1", "a", vec![]);
    let rx = orchestrator.start_turn(hanging.clone()).unwrap();

    assert!(matches!(
        orchestrator.start_turn(hanging),
        Err(OrchestratorError::DuplicateTurn(id)) if id == "a"
    ));
    assert!(matches!(
        orchestrator.start_turn(request("b")),
        Err(OrchestratorError::TooManyStreams(1))
    ));
    let active = orchestrator.active_turns();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].provider_id, "hang");

    assert!(orchestrator.cancel("a"));
    let events = collect(rx).await;
    assert!(last_is_end(&events, true));
    assert!(orchestrator.active_turns().is_empty());
    assert!(!orchestrator.cancel("a"));

    let events = collect(orchestrator.start_turn(request("b")).unwrap()).await;
    assert!(last_is_end(&events, false));
}

#[tokio::test]
async fn unregistered_model_provider_is_rejected() {
    let (orchestrator, _) = started_fixture().await;
    assert!(matches!(
        orchestrator.start_turn(request("t1")),
        Err(OrchestratorError::UnknownAdapter(p)) if p == "mock"
    ));
}

#[tokio::test]
async fn model_listing_is_an_optional_capability() {
    let (orchestrator, _) = started_fixture().await;
    orchestrator.register_adapter("plain", Arc::new(MockLlmProvider::new()));
    orchestrator.register_adapter(
        "listing",
        Arc::new(MockLlmProvider::new().with_models(vec![ModelInfo {
            id: "mock-1".to_string(),
            name: "Mock One".to_string(),
            native_tools: true,
        }])),
    );

    let models = orchestrator.list_models("listing").await.unwrap();
    assert_eq!(models[0].id, "mock-1");
    assert!(matches!(
        orchestrator.list_models("plain").await,
        Err(OrchestratorError::CapabilityNotSupported(_))
    ));
    assert!(matches!(
        orchestrator.list_models("nobody").await,
        Err(OrchestratorError::UnknownAdapter(_))
    ));
}

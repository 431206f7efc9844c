//! End-to-end pipeline scenarios
//!
//! Exercises the full translate/assemble path over synthetic upstream
//! event sequences, plus the cross-cutting pool behaviors (fail-over
//! bookkeeping, refresh coordination, request dedup).

use serde_json::json;

use crate::amazonq::client::dedupe_assistant_events;
use crate::amazonq::model::events::{
    AssistantResponseEvent, Event, InitialResponseEvent, ToolUseEvent,
};
use crate::amazonq::model_mapping::map_model_to_amazonq;
use crate::anthropic::stream::ClaudeStreamHandler;
use crate::core::dedupe::{RequestDeduper, client_id, fingerprint, make_key};
use crate::dispatch::select_best_account;
use crate::openai::stream::OpenAiStreamHandler;
use crate::store::accounts::AccountStore;
use crate::store::db::Database;

fn initial(conversation_id: &str) -> Event {
    Event::InitialResponse(InitialResponseEvent {
        conversation_id: Some(conversation_id.to_string()),
    })
}

fn assistant(content: &str) -> Event {
    Event::AssistantResponse(AssistantResponseEvent {
        content: content.to_string(),
    })
}

fn tool_use(id: &str, name: Option<&str>, input: Option<serde_json::Value>, stop: bool) -> Event {
    Event::ToolUse(ToolUseEvent {
        tool_use_id: Some(id.to_string()),
        name: name.map(String::from),
        input,
        stop,
    })
}

/// Scenario: OpenAI streaming tool call.
///
/// Upstream emits text with a thinking region, then a fragmented tool
/// call. Expected: role-only delta, clean content delta, tool_calls frames
/// with sticky id/name, argument fragments in order, and a tool_calls
/// terminator with usage.
#[test]
fn scenario_openai_streaming_tool_call() {
    let model = map_model_to_amazonq(Some("claude-opus-4-1-20250805"), "auto");
    assert_eq!(model, "claude-opus-4.5");

    let events = vec![
        initial("cid"),
        assistant("hello <thinking>x</thinking>"),
        tool_use("call_1", Some("get_weather"), Some(json!({"city": "sf"})), false),
        tool_use("call_1", None, Some(json!({"unit": "c"})), false),
        tool_use("call_1", None, None, true),
        Event::ResponseEnd,
    ];

    let mut handler = OpenAiStreamHandler::new(model);
    let mut frames = Vec::new();
    for event in &events {
        frames.extend(handler.handle_event(event));
    }
    frames.extend(handler.finish(12, 1.0));

    // Role-only delta first, with the mapped model id
    assert_eq!(frames[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(frames[0]["model"], "claude-opus-4.5");
    assert_eq!(frames[0]["object"], "chat.completion.chunk");

    // Thinking stripped from the content delta
    assert_eq!(frames[1]["choices"][0]["delta"]["content"], "hello ");

    // First tool frame: index 0, id, name, empty arguments
    let call = &frames[2]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["index"], 0);
    assert_eq!(call["id"], "call_1");
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(call["function"]["arguments"], "");

    // Argument fragments in order
    assert_eq!(
        frames[3]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        r#"{"city":"sf"}"#
    );
    assert_eq!(
        frames[4]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        r#"{"unit":"c"}"#
    );

    // Terminator
    let last = frames.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(last["usage"]["prompt_tokens"], 12);
    assert!(last["usage"]["total_tokens"].as_u64().unwrap() >= 12);
}

/// Scenario: Anthropic response assembly for a non-streaming caller.
///
/// One text event assembles into a single text block with the upstream
/// conversation id preserved on the handler.
#[test]
fn scenario_anthropic_simple_assembly() {
    let model = map_model_to_amazonq(Some("claude-opus-4-1-20250805"), "auto");
    let events = vec![initial("cid-123"), assistant("hello"), Event::ResponseEnd];

    let mut handler = ClaudeStreamHandler::new(model, 3);
    let mut frames = Vec::new();
    for event in &events {
        frames.extend(handler.handle_event(event));
    }
    frames.extend(handler.finish(1.0));

    assert_eq!(handler.conversation_id.as_deref(), Some("cid-123"));

    let text: String = frames
        .iter()
        .filter(|f| f.data["delta"]["type"] == "text_delta")
        .map(|f| f.data["delta"]["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(text, "hello");

    let start = frames.iter().find(|f| f.event == "message_start").unwrap();
    assert_eq!(start.data["message"]["model"], "claude-opus-4.5");

    let delta = frames.iter().find(|f| f.event == "message_delta").unwrap();
    assert_eq!(delta.data["delta"]["stop_reason"], "end_turn");
    assert_eq!(frames.last().unwrap().event, "message_stop");
}

/// Scenario: quota fail-over bookkeeping.
///
/// Account A trips the monthly counter: marked quota-exhausted and
/// disabled. Account B serves: success recorded. The candidate selector no
/// longer returns A.
#[tokio::test]
async fn scenario_account_fallback_on_quota() {
    let db = Database::connect_memory().await.unwrap();
    let store = AccountStore::new(db, 100, false);

    let a = store
        .create_account_from_tokens("c", "s", "at-a", Some("rt-a"), Some("A"), true, Some(3600))
        .await
        .unwrap();
    let b = store
        .create_account_from_tokens("c", "s", "at-b", Some("rt-b"), Some("B"), true, Some(3600))
        .await
        .unwrap();

    // A hits MONTHLY_REQUEST_COUNT throttling
    store
        .update_account_stats(&a.id, false, true, true)
        .await
        .unwrap();
    // B streams normally
    store.update_account_stats(&b.id, true, false, false).await.unwrap();

    let a_row = store.get_account(&a.id).await.unwrap();
    assert!(a_row.quota_exhausted);
    assert!(!a_row.enabled);

    let b_row = store.get_account(&b.id).await.unwrap();
    assert_eq!(b_row.success_count, 1);
    assert!(b_row.enabled);

    let candidates = store.list_enabled_accounts().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(select_best_account(&candidates).unwrap().id, b.id);
}

/// Scenario: concurrent refresh coordination.
///
/// Ten concurrent refreshes of the same account serialize on the advisory
/// lock; the debounce window means no caller observes a torn row and the
/// refresh status stays `success`.
#[tokio::test]
async fn scenario_concurrent_refresh_single_flight() {
    use crate::core::lock::DistributedLockManager;
    use crate::model::config::Config;
    use crate::store::refresher::TokenRefresher;
    use std::sync::Arc;

    let db = Database::connect_memory().await.unwrap();
    let store = AccountStore::new(db, 100, false);
    let dir = tempfile::tempdir().unwrap();
    let locks = DistributedLockManager::new(dir.path(), 10.0, 300.0).unwrap();
    let refresher = TokenRefresher::new(
        store.clone(),
        Arc::new(Config::default()),
        locks,
        reqwest::Client::new(),
    );

    // Fresh row: last_refresh_time = now, no expiry -> debounce path
    let account = store
        .create_account_from_tokens("c", "s", "at", Some("rt"), None, true, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let refresher = refresher.clone();
        let id = account.id.clone();
        handles.push(tokio::spawn(async move {
            refresher.refresh_access_token(&id).await
        }));
    }

    for handle in handles {
        let row = handle.await.unwrap().expect("refresh call succeeds");
        assert_eq!(row.access_token.as_deref(), Some("at"));
        assert_eq!(row.last_refresh_status.as_deref(), Some("success"));
    }
}

/// Scenario: request dedup distinguishes callers.
///
/// Two identical bodies from the same end user inside the window: second
/// is a duplicate. The same body from a different end user passes.
#[test]
fn scenario_request_dedupe_scoped_by_user() {
    use axum::http::HeaderMap;

    let deduper = RequestDeduper::new(60_000, 1000);
    let body = json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "hi"}]});
    let fp = fingerprint(&body);

    let mut alice = HeaderMap::new();
    alice.insert("x-end-user-id", "alice".parse().unwrap());
    let mut bob = HeaderMap::new();
    bob.insert("x-end-user-id", "bob".parse().unwrap());

    let alice_key = make_key(
        &client_id(&alice, "1.1.1.1"),
        "/v1/messages/count_tokens",
        "claude-sonnet-4",
        &fp,
    );
    let bob_key = make_key(
        &client_id(&bob, "1.1.1.1"),
        "/v1/messages/count_tokens",
        "claude-sonnet-4",
        &fp,
    );

    assert!(deduper.check_and_mark(&alice_key).is_none());
    let retry = deduper.check_and_mark(&alice_key);
    assert!(retry.is_some() && retry.unwrap() > 0);
    assert!(deduper.check_and_mark(&bob_key).is_none());
}

/// Upstream cumulative re-sends collapse to clean deltas before the
/// dialect emitters see them.
#[tokio::test]
async fn scenario_stream_dedupe_before_emission() {
    use futures::StreamExt;

    let events = futures::stream::iter(vec![
        initial("cid"),
        assistant("Hel"),
        assistant("Hello"),
        assistant("Hello world"),
        Event::ResponseEnd,
    ]);
    let deduped: Vec<Event> = dedupe_assistant_events(events).collect().await;

    let mut handler = ClaudeStreamHandler::new("claude-sonnet-4", 0);
    let mut text = String::new();
    for event in &deduped {
        for frame in handler.handle_event(event) {
            if frame.data["delta"]["type"] == "text_delta" {
                text.push_str(frame.data["delta"]["text"].as_str().unwrap());
            }
        }
    }
    assert_eq!(text, "Hello world");
}

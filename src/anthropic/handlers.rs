//! Anthropic-compatible endpoints

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Value, json};

use crate::amazonq::model_mapping::map_model_to_amazonq;
use crate::core::tokenizer::{budget_estimate, count_tokens_scaled};
use crate::dispatch::{AppState, DispatchError};
use crate::store::sessions::generate_session_key;

use super::converter::{ConvertOptions, ConversionError, convert_request};
use super::stream::{ClaudeStreamHandler, SseEvent};
use super::types::{
    CountTokensResponse, ErrorResponse, MessageContent, MessagesRequest, ModelsResponse,
    supported_models,
};

/// Error body in the Anthropic shape, with Retry-After on 429s.
fn error_response(err: &DispatchError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    let error_type = match err {
        DispatchError::InvalidApiKey | DispatchError::NoAccounts => "authentication_error",
        DispatchError::Forbidden(_) | DispatchError::AllSuspended => "permission_error",
        DispatchError::BadRequest(_) => "invalid_request_error",
        DispatchError::QuotaExhaustedAll => "billing_error",
        DispatchError::Duplicate { .. } | DispatchError::RateLimited => "rate_limit_error",
        DispatchError::Upstream(_) => "api_error",
    };
    let body = ErrorResponse::new(error_type, err.to_string()).with_code(err.code());

    let mut response = (status, Json(body)).into_response();
    if let DispatchError::Duplicate { retry_after_ms } = err {
        let secs = retry_after_ms.div_ceil(1000).max(1);
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

fn message_texts(req: &MessagesRequest) -> Vec<String> {
    req.messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    super::types::ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        })
        .collect()
}

fn input_text(req: &MessagesRequest) -> String {
    let mut text = req
        .system
        .as_ref()
        .map(|s| s.to_text())
        .unwrap_or_default();
    for t in message_texts(req) {
        text.push_str(&t);
    }
    text
}

fn end_user_id(headers: &HeaderMap, req: &MessagesRequest) -> Option<String> {
    headers
        .get("x-end-user-id")
        .or_else(|| headers.get("x-user-id"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            req.metadata
                .as_ref()
                .and_then(|m| m.user_id.clone())
                .filter(|v| !v.is_empty())
        })
}

/// POST /v1/messages
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let req: MessagesRequest = match serde_json::from_value(body.clone()) {
        Ok(req) => req,
        Err(e) => {
            return error_response(&DispatchError::BadRequest(format!(
                "Invalid request body: {}",
                e
            )));
        }
    };

    let auth = match state.authenticate(&headers, None).await {
        Ok(auth) => auth,
        Err(e) => return error_response(&e),
    };

    let model = map_model_to_amazonq(Some(&req.model), &state.config.amazon_q_default_model);
    let conversation_id = headers
        .get("x-conversation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| req.conversation_id.clone().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Err(e) = state.check_dedupe(&headers, "/v1/messages", &model, &body, &auth.client_ip) {
        return error_response(&e);
    }

    // Token budget gate
    let input_estimate = budget_estimate(&input_text(&req));
    if input_estimate > state.config.max_tokens_per_request {
        return error_response(&DispatchError::BadRequest(format!(
            "Request exceeds the {} token limit",
            state.config.max_tokens_per_request
        )));
    }

    let user_id = end_user_id(&headers, &req);
    let session_key = generate_session_key(&message_texts(&req), user_id.as_deref());

    let convert_opts = ConvertOptions {
        conversation_id: conversation_id.clone(),
        model_id: model.clone(),
        client_os: state.config.amazon_q_client_os.clone(),
        client_cwd: state.config.amazon_q_client_cwd.clone(),
        strict: state.config.debug_message_conversion,
    };
    let aq_body = match convert_request(&req, &convert_opts) {
        Ok(body) => body,
        Err(ConversionError::EmptyMessages) => {
            return error_response(&DispatchError::BadRequest("Message list is empty".into()));
        }
        Err(e) => return error_response(&DispatchError::BadRequest(e.to_string())),
    };

    let account = match state.select_account(&auth, &headers, Some(&session_key)).await {
        Ok(account) => account,
        Err(e) => return error_response(&e),
    };
    tracing::info!(
        "Anthropic request: model={} stream={} account={}",
        model,
        req.stream,
        account.id
    );

    let (account, events) = match state
        .send_with_failover(&auth, account, &aq_body, &conversation_id)
        .await
    {
        Ok(pair) => pair,
        Err(e) => return error_response(&e),
    };

    let input_tokens =
        count_tokens_scaled(&input_text(&req), state.config.token_count_multiplier);
    let handler = ClaudeStreamHandler::new(model.clone(), input_tokens);

    if req.stream {
        stream_response(state, account.id, session_key, conversation_id, events, handler)
    } else {
        aggregate_response(state, account.id, session_key, conversation_id, model, events, handler)
            .await
    }
}

/// Streaming SSE response.
fn stream_response(
    state: AppState,
    account_id: String,
    session_key: String,
    conversation_id: String,
    mut events: crate::amazonq::client::EventStream,
    mut handler: ClaudeStreamHandler,
) -> Response {
    let guard = state.usage_guard(&account_id, &session_key);
    let multiplier = state.config.token_count_multiplier;

    let sse = async_stream::stream! {
        while let Some(event) = events.next().await {
            for frame in handler.handle_event(&event) {
                guard.mark_emitted();
                yield Ok::<String, std::convert::Infallible>(frame.to_sse_string());
            }
            if handler.has_upstream_error().is_some() {
                break;
            }
        }
        for frame in handler.finish(multiplier) {
            guard.mark_emitted();
            yield Ok(frame.to_sse_string());
        }

        if let Some(error) = handler.has_upstream_error() {
            // Bytes already reached the client; the account still served
            tracing::warn!("Stream interrupted by upstream error: {}", error);
        }
        guard.mark_completed();
        state.record_success(&account_id, Some(&session_key)).await;
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(sse))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    set_conversation_headers(&mut response, &conversation_id);
    response
}

/// Non-streaming: run the same event pipeline and fold the SSE frames into
/// a single message body.
async fn aggregate_response(
    state: AppState,
    account_id: String,
    session_key: String,
    conversation_id: String,
    model: String,
    mut events: crate::amazonq::client::EventStream,
    mut handler: ClaudeStreamHandler,
) -> Response {
    let mut frames: Vec<SseEvent> = Vec::new();
    while let Some(event) = events.next().await {
        frames.extend(handler.handle_event(&event));
        if handler.has_upstream_error().is_some() {
            break;
        }
    }
    frames.extend(handler.finish(state.config.token_count_multiplier));

    if let Some(error) = handler.has_upstream_error() {
        if frames.iter().all(|f| f.event != "content_block_delta") {
            let _ = state
                .accounts
                .update_account_stats(&account_id, false, false, false)
                .await;
            return error_response(&DispatchError::Upstream(error.to_string()));
        }
    }

    let mut content: Vec<Value> = Vec::new();
    let mut partial_json: std::collections::HashMap<usize, String> = Default::default();
    let mut stop_reason = Value::Null;
    let mut usage = json!({"input_tokens": 0, "output_tokens": 0});

    for frame in &frames {
        let data = &frame.data;
        match data.get("type").and_then(|v| v.as_str()) {
            Some("content_block_start") => {
                let idx = data["index"].as_u64().unwrap_or(0) as usize;
                while content.len() <= idx {
                    content.push(Value::Null);
                }
                content[idx] = data["content_block"].clone();
            }
            Some("content_block_delta") => {
                let idx = data["index"].as_u64().unwrap_or(0) as usize;
                let delta = &data["delta"];
                let Some(block) = content.get_mut(idx) else {
                    continue;
                };
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = block.get_mut("text").and_then(|v| v.as_str().map(String::from)) {
                            block["text"] =
                                Value::String(text + delta["text"].as_str().unwrap_or(""));
                        }
                    }
                    Some("thinking_delta") => {
                        let existing = block
                            .get("thinking")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        block["thinking"] =
                            Value::String(existing + delta["thinking"].as_str().unwrap_or(""));
                    }
                    Some("input_json_delta") => {
                        partial_json
                            .entry(idx)
                            .or_default()
                            .push_str(delta["partial_json"].as_str().unwrap_or(""));
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let idx = data["index"].as_u64().unwrap_or(0) as usize;
                if let (Some(block), Some(raw)) = (content.get_mut(idx), partial_json.remove(&idx))
                {
                    if block["type"] == "tool_use" {
                        if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                            block["input"] = parsed;
                        }
                    }
                }
            }
            Some("message_delta") => {
                stop_reason = data["delta"]["stop_reason"].clone();
                if data.get("usage").is_some() {
                    usage = data["usage"].clone();
                }
            }
            _ => {}
        }
    }

    state.record_success(&account_id, Some(&session_key)).await;

    let body = json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "conversation_id": conversation_id,
        "conversationId": conversation_id,
        "content": content.into_iter().filter(|c| !c.is_null()).collect::<Vec<_>>(),
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage
    });

    let mut response = (StatusCode::OK, Json(body)).into_response();
    set_conversation_headers(&mut response, &conversation_id);
    response
}

fn set_conversation_headers(response: &mut Response, conversation_id: &str) {
    if let Ok(value) = conversation_id.parse() {
        response
            .headers_mut()
            .insert("X-Conversation-Id", value);
    }
    if let Ok(value) = conversation_id.parse() {
        response
            .headers_mut()
            .insert("X-ConversationId", value);
    }
}

/// POST /v1/messages/count_tokens
pub async fn count_tokens_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let req: MessagesRequest = match serde_json::from_value(body.clone()) {
        Ok(req) => req,
        Err(e) => {
            return error_response(&DispatchError::BadRequest(format!(
                "Invalid request body: {}",
                e
            )));
        }
    };

    let auth = match state.authenticate(&headers, None).await {
        Ok(auth) => auth,
        Err(e) => return error_response(&e),
    };

    let model = map_model_to_amazonq(Some(&req.model), &state.config.amazon_q_default_model);
    if let Err(e) = state.check_dedupe(
        &headers,
        "/v1/messages/count_tokens",
        &model,
        &body,
        &auth.client_ip,
    ) {
        return error_response(&e);
    }

    let input_tokens =
        count_tokens_scaled(&input_text(&req), state.config.token_count_multiplier) as i64;
    (StatusCode::OK, Json(CountTokensResponse { input_tokens })).into_response()
}

/// GET /v1/models (public)
pub async fn list_models() -> Response {
    (
        StatusCode::OK,
        Json(ModelsResponse {
            data: supported_models(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_text_combines_system_and_messages() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "system": "sys",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": [{"type": "text", "text": "two"}]}
            ]
        }))
        .unwrap();
        assert_eq!(input_text(&req), "sysonetwo");
    }

    #[test]
    fn test_end_user_id_header_beats_metadata() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "metadata": {"user_id": "meta-user"}
        }))
        .unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(end_user_id(&headers, &req).as_deref(), Some("meta-user"));

        headers.insert("x-end-user-id", "header-user".parse().unwrap());
        assert_eq!(end_user_id(&headers, &req).as_deref(), Some("header-user"));
    }

    #[test]
    fn test_error_response_shapes() {
        let resp = error_response(&DispatchError::Duplicate { retry_after_ms: 1500 });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "2");

        let resp = error_response(&DispatchError::QuotaExhaustedAll);
        assert_eq!(resp.status().as_u16(), 402);
    }
}

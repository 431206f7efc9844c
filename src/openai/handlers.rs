//! OpenAI-compatible endpoints

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Value, json};

use crate::amazonq::model_mapping::map_model_to_amazonq;
use crate::anthropic::converter::{ConvertOptions, convert_request};
use crate::anthropic::types::{MessageContent, MessagesRequest};
use crate::core::compressor::{PlainMessage, compress_messages, estimate_total};
use crate::core::tokenizer::count_tokens_scaled;
use crate::dispatch::{AppState, DispatchError};
use crate::store::sessions::generate_session_key;

use super::converter::to_messages_request;
use super::stream::OpenAiStreamHandler;
use super::types::{ChatCompletionRequest, OpenAiErrorResponse};

/// Error body in the OpenAI `{error:{message,type,code}}` shape.
fn error_response(err: &DispatchError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    let error_type = match err {
        DispatchError::InvalidApiKey | DispatchError::NoAccounts => "invalid_api_key",
        DispatchError::BadRequest(_) => "invalid_request_error",
        DispatchError::Forbidden(_) | DispatchError::AllSuspended => "permission_error",
        DispatchError::QuotaExhaustedAll => "insufficient_quota",
        DispatchError::Duplicate { .. } | DispatchError::RateLimited => "rate_limit_error",
        DispatchError::Upstream(_) => "api_error",
    };
    let body = OpenAiErrorResponse::new(error_type, err.to_string()).with_code(err.code());

    let mut response = (status, Json(body)).into_response();
    if let DispatchError::Duplicate { retry_after_ms } = err {
        let secs = retry_after_ms.div_ceil(1000).max(1);
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

fn plain_messages(req: &ChatCompletionRequest) -> Vec<PlainMessage> {
    req.messages
        .iter()
        .map(|m| PlainMessage {
            role: m.role.clone(),
            content: m
                .content
                .as_ref()
                .map(|c| match c {
                    Value::String(s) => s.clone(),
                    Value::Array(parts) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
        })
        .collect()
}

fn neutral_texts(req: &MessagesRequest) -> Vec<String> {
    req.messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    crate::anthropic::types::ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        })
        .collect()
}

fn input_text(req: &MessagesRequest) -> String {
    let mut text = req.system.as_ref().map(|s| s.to_text()).unwrap_or_default();
    for t in neutral_texts(req) {
        text.push_str(&t);
    }
    text
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut req: ChatCompletionRequest = match serde_json::from_value(body.clone()) {
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
        "/v1/chat/completions",
        &model,
        &body,
        &auth.client_ip,
    ) {
        return error_response(&e);
    }

    // Oversize handling: tool-mode requests never compress (dropping
    // context would break tool pairing) and are rejected instead
    let has_tools = req.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
        || req.functions.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
    let plain = plain_messages(&req);
    let estimate = estimate_total(&plain, state.config.max_tokens_per_request);

    if estimate > state.config.max_tokens_per_request {
        return error_response(&DispatchError::BadRequest(format!(
            "Request exceeds the {} token limit",
            state.config.max_tokens_per_request
        )));
    }
    if estimate > state.config.token_compress_threshold {
        if has_tools {
            return error_response(&DispatchError::BadRequest(
                "Request exceeds the compression threshold and tool mode cannot be compressed"
                    .into(),
            ));
        }
        let compressed = compress_messages(plain, state.config.token_compress_threshold);
        tracing::info!(
            "Compressed oversized conversation: {} -> {} messages",
            req.messages.len(),
            compressed.len()
        );
        req.messages = compressed
            .into_iter()
            .map(|m| super::types::ChatMessage {
                role: m.role,
                content: Some(Value::String(m.content)),
                name: None,
                tool_calls: None,
                tool_call_id: None,
                function_call: None,
            })
            .collect();
    }

    let neutral = match to_messages_request(&req) {
        Ok(neutral) => neutral,
        Err(e) => return error_response(&DispatchError::BadRequest(e)),
    };

    let conversation_id = uuid::Uuid::new_v4().to_string();
    let user_id = headers
        .get("x-end-user-id")
        .or_else(|| headers.get("x-user-id"))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.user.clone());
    let session_key = generate_session_key(&neutral_texts(&neutral), user_id.as_deref());

    let convert_opts = ConvertOptions {
        conversation_id: conversation_id.clone(),
        model_id: model.clone(),
        client_os: state.config.amazon_q_client_os.clone(),
        client_cwd: state.config.amazon_q_client_cwd.clone(),
        strict: state.config.debug_message_conversion,
    };
    let aq_body = match convert_request(&neutral, &convert_opts) {
        Ok(body) => body,
        Err(e) => return error_response(&DispatchError::BadRequest(e.to_string())),
    };

    let account = match state
        .select_account(&auth, &headers, Some(&session_key))
        .await
    {
        Ok(account) => account,
        Err(e) => return error_response(&e),
    };
    tracing::info!(
        "OpenAI request: model={} stream={} account={}",
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
        count_tokens_scaled(&input_text(&neutral), state.config.token_count_multiplier);
    let handler = OpenAiStreamHandler::new(model.clone());

    if req.stream {
        stream_response(state, account.id, session_key, events, handler, input_tokens)
    } else {
        aggregate_response(state, account.id, session_key, model, events, handler, input_tokens)
            .await
    }
}

fn sse_format(frame: &Value) -> String {
    format!("data: {}\n\n", frame)
}

fn stream_response(
    state: AppState,
    account_id: String,
    session_key: String,
    mut events: crate::amazonq::client::EventStream,
    mut handler: OpenAiStreamHandler,
    input_tokens: usize,
) -> Response {
    let guard = state.usage_guard(&account_id, &session_key);
    let multiplier = state.config.token_count_multiplier;

    let sse = async_stream::stream! {
        while let Some(event) = events.next().await {
            for frame in handler.handle_event(&event) {
                guard.mark_emitted();
                yield Ok::<String, std::convert::Infallible>(sse_format(&frame));
            }
            if handler.has_upstream_error().is_some() {
                break;
            }
        }
        for frame in handler.finish(input_tokens, multiplier) {
            guard.mark_emitted();
            yield Ok(sse_format(&frame));
        }
        yield Ok("data: [DONE]\n\n".to_string());

        guard.mark_completed();
        state.record_success(&account_id, Some(&session_key)).await;
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(sse))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Non-streaming: aggregate the chunk pipeline into one completion object
/// without breaking the `finish_reason=tool_calls` contract.
async fn aggregate_response(
    state: AppState,
    account_id: String,
    session_key: String,
    model: String,
    mut events: crate::amazonq::client::EventStream,
    mut handler: OpenAiStreamHandler,
    input_tokens: usize,
) -> Response {
    let mut frames: Vec<Value> = Vec::new();
    while let Some(event) = events.next().await {
        frames.extend(handler.handle_event(&event));
        if handler.has_upstream_error().is_some() {
            break;
        }
    }
    frames.extend(handler.finish(input_tokens, state.config.token_count_multiplier));

    if let Some(error) = handler.has_upstream_error() {
        if handler.text().is_empty() {
            let _ = state
                .accounts
                .update_account_stats(&account_id, false, false, false)
                .await;
            return error_response(&DispatchError::Upstream(error.to_string()));
        }
    }

    // Fold tool_calls deltas back together by index
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut usage = json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0});
    let mut finish_reason = Value::Null;

    for frame in &frames {
        if let Some(u) = frame.get("usage").filter(|u| !u.is_null()) {
            usage = u.clone();
        }
        let choice = &frame["choices"][0];
        if let Some(reason) = choice.get("finish_reason").filter(|r| !r.is_null()) {
            finish_reason = reason.clone();
        }
        let Some(calls) = choice["delta"]["tool_calls"].as_array() else {
            continue;
        };
        for call in calls {
            let idx = call["index"].as_u64().unwrap_or(0) as usize;
            while tool_calls.len() <= idx {
                tool_calls.push(json!({
                    "id": "",
                    "type": "function",
                    "function": {"name": "", "arguments": ""}
                }));
            }
            if let Some(id) = call["id"].as_str() {
                tool_calls[idx]["id"] = json!(id);
            }
            if let Some(name) = call["function"]["name"].as_str() {
                tool_calls[idx]["function"]["name"] = json!(name);
            }
            if let Some(args) = call["function"]["arguments"].as_str() {
                let existing = tool_calls[idx]["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string();
                tool_calls[idx]["function"]["arguments"] = json!(existing + args);
            }
        }
    }

    state.record_success(&account_id, Some(&session_key)).await;

    let mut message = json!({
        "role": "assistant",
        "content": if handler.text().is_empty() { Value::Null } else { json!(handler.text()) }
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    let body = json!({
        "id": handler.id(),
        "object": "chat.completion",
        "created": handler.created(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason
        }],
        "usage": usage
    });
    (StatusCode::OK, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_messages_flatten_parts() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "user", "content": [{"type": "text", "text": "b"}, {"type": "text", "text": "c"}]}
            ]
        }))
        .unwrap();
        let plain = plain_messages(&req);
        assert_eq!(plain[0].content, "a");
        assert_eq!(plain[1].content, "b\nc");
    }

    #[test]
    fn test_error_shape_uses_openai_fields() {
        let resp = error_response(&DispatchError::InvalidApiKey);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = error_response(&DispatchError::RateLimited);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_sse_format() {
        assert_eq!(sse_format(&json!({"a": 1})), "data: {\"a\":1}\n\n");
    }
}

//! Amazon Q chat client
//!
//! Sends `conversationState` bodies upstream and turns the binary event
//! stream into typed [`Event`]s. Upstream is always called in streaming
//! mode so the full event structure (tool use, thinking) is preserved even
//! for non-streaming callers.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::amazonq::errors::{is_account_suspended_error, is_quota_exhausted_error};
use crate::amazonq::model::events::Event;
use crate::amazonq::model::requests::conversation::ChatRequestBody;
use crate::amazonq::parser::EventStreamDecoder;
use crate::core::delta::delta_by_prefix;
use crate::model::config::Config;

/// Typed upstream failure, classified before the generic error detector
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("account quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("account suspended: {0}")]
    Suspended(String),
    #[error("account unauthorized: {0}")]
    Unauthorized(String),
    #[error("upstream HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("upstream network error: {0}")]
    Network(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Classify a non-success HTTP response body.
fn classify_http_error(status: u16, body: String) -> UpstreamError {
    if is_quota_exhausted_error(&body) {
        return UpstreamError::QuotaExhausted(truncate(&body, 300));
    }
    if is_account_suspended_error(&body) {
        return UpstreamError::Suspended(truncate(&body, 300));
    }
    if status == 401 || status == 403 {
        return UpstreamError::Unauthorized(format!("HTTP {}", status));
    }
    UpstreamError::Http {
        status,
        body: truncate(&body, 500),
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// POST a chat request and return the decoded event stream.
///
/// The stream already carries assistant-content deduplication and a
/// conversation id injected into `initial-response` when upstream omits it.
pub async fn send_chat_request(
    client: &reqwest::Client,
    config: &Arc<Config>,
    access_token: &str,
    body: &ChatRequestBody,
    conversation_id: Option<String>,
) -> Result<EventStream, UpstreamError> {
    let response = client
        .post(config.amazon_q_endpoint())
        .header("content-type", "application/x-amz-json-1.0")
        .header("x-amz-target", &config.amazon_q_target)
        .header("user-agent", &config.amazon_q_user_agent)
        .header("x-amz-user-agent", &config.amazon_q_x_amz_user_agent)
        .header("x-amzn-codewhisperer-optout", &config.amazon_q_optout)
        .header("amz-sdk-request", "attempt=1; max=3")
        .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
        .header("Authorization", format!("Bearer {}", access_token))
        .json(body)
        .send()
        .await
        .map_err(|e| UpstreamError::Network(e.without_url().to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_http_error(status.as_u16(), body));
    }

    let byte_stream = response.bytes_stream();
    let events = decode_event_stream(byte_stream, conversation_id);
    Ok(Box::pin(dedupe_assistant_events(events)))
}

/// Decode raw bytes into events, injecting the conversation id.
fn decode_event_stream(
    bytes: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    conversation_id: Option<String>,
) -> impl Stream<Item = Event> + Send {
    async_stream::stream! {
        futures::pin_mut!(bytes);
        let mut decoder = EventStreamDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let message = e.without_url().to_string();
                    tracing::warn!("Upstream byte stream error: {}", message);
                    yield Event::Error {
                        error_code: "NetworkError".to_string(),
                        error_message: message,
                    };
                    return;
                }
            };

            if let Err(e) = decoder.feed(&chunk) {
                tracing::error!("Event stream buffer error: {}", e);
                return;
            }

            let frames = match decoder.drain() {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::error!("Event stream decoding stopped: {}", e);
                    return;
                }
            };

            for frame in frames {
                match Event::from_frame(frame) {
                    Ok(Event::InitialResponse(mut ev)) => {
                        if ev.conversation_id.is_none() {
                            ev.conversation_id = conversation_id.clone();
                        }
                        yield Event::InitialResponse(ev);
                    }
                    Ok(Event::Unknown) => {}
                    Ok(event) => yield event,
                    Err(e) => tracing::warn!("Skipping undecodable event payload: {}", e),
                }
            }
        }
    }
}

/// Strip cumulative re-sends from assistant content events.
pub fn dedupe_assistant_events(
    events: impl Stream<Item = Event> + Send,
) -> impl Stream<Item = Event> + Send {
    async_stream::stream! {
        futures::pin_mut!(events);
        let mut last_content = String::new();

        while let Some(event) = events.next().await {
            match event {
                Event::AssistantResponse(mut ev) if !ev.content.is_empty() => {
                    let (merged, delta) = delta_by_prefix(&last_content, &ev.content);
                    last_content = merged;
                    if delta.is_empty() {
                        continue;
                    }
                    ev.content = delta;
                    yield Event::AssistantResponse(ev);
                }
                other => yield other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amazonq::model::events::AssistantResponseEvent;

    fn assistant(content: &str) -> Event {
        Event::AssistantResponse(AssistantResponseEvent {
            content: content.to_string(),
        })
    }

    async fn collect_assistant_text(events: Vec<Event>) -> String {
        let stream = futures::stream::iter(events);
        let deduped: Vec<Event> = dedupe_assistant_events(stream).collect().await;
        deduped
            .into_iter()
            .filter_map(|e| match e {
                Event::AssistantResponse(ev) => Some(ev.content),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_dedupe_cumulative_resends() {
        let text = collect_assistant_text(vec![
            assistant("Hello"),
            assistant("Hello world"),
            assistant("Hello world"),
            assistant("Hello world!"),
        ])
        .await;
        assert_eq!(text, "Hello world!");
    }

    #[tokio::test]
    async fn test_dedupe_passes_true_deltas() {
        let text =
            collect_assistant_text(vec![assistant("a"), assistant("b"), assistant("c")]).await;
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn test_dedupe_leaves_other_events() {
        let events = vec![assistant("x"), Event::ResponseEnd];
        let stream = futures::stream::iter(events);
        let out: Vec<Event> = dedupe_assistant_events(stream).collect().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Event::ResponseEnd));
    }

    #[test]
    fn test_classify_quota() {
        let err = classify_http_error(
            429,
            r#"{"__type":"ThrottlingException","reason":"MONTHLY_REQUEST_COUNT"}"#.into(),
        );
        assert!(matches!(err, UpstreamError::QuotaExhausted(_)));
    }

    #[test]
    fn test_classify_suspended() {
        let err = classify_http_error(403, r#"{"reason":"TEMPORARILY_SUSPENDED"}"#.into());
        assert!(matches!(err, UpstreamError::Suspended(_)));
    }

    #[test]
    fn test_classify_unauthorized_and_generic() {
        assert!(matches!(
            classify_http_error(401, "token expired".into()),
            UpstreamError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_http_error(500, "oops".into()),
            UpstreamError::Http { status: 500, .. }
        ));
    }
}

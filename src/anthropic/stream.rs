//! Upstream events → Anthropic SSE
//!
//! Stateful assembly of the Anthropic event sequence: `message_start`,
//! `ping`, per-block start/delta/stop, `message_delta`, `message_stop`.
//! Thinking regions are cut out of the text stream and re-emitted as
//! `thinking` deltas; tool calls are assembled from `toolUseEvent`
//! fragments.

use serde_json::json;
use std::collections::HashSet;

use crate::amazonq::model::events::{Event, ToolUseEvent};
use crate::core::tokenizer::count_tokens;

const THINKING_START_TAG: &str = "<thinking>";
const THINKING_END_TAG: &str = "</thinking>";

/// One SSE frame
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_sse_string(&self) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.event,
            serde_json::to_string(&self.data).unwrap_or_default()
        )
    }
}

/// Longest prefix of `tag` that the buffer ends with (a tag possibly split
/// across chunk boundaries).
fn pending_tag_suffix(buffer: &str, tag: &str) -> usize {
    if buffer.is_empty() || tag.is_empty() {
        return 0;
    }
    let max_len = buffer.len().min(tag.len() - 1);
    for length in (1..=max_len).rev() {
        if !buffer.is_char_boundary(buffer.len() - length) {
            continue;
        }
        if buffer.ends_with(&tag[..length]) {
            return length;
        }
    }
    0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

pub struct ClaudeStreamHandler {
    model: String,
    input_tokens: usize,
    message_id: String,
    pub conversation_id: Option<String>,
    message_start_sent: bool,

    block_index: i64,
    open_block: Option<BlockKind>,

    think_buffer: String,
    in_think_block: bool,
    text_out: String,
    thinking_out: String,

    current_tool_id: Option<String>,
    tool_input_buffer: String,
    all_tool_inputs: String,
    processed_tool_ids: HashSet<String>,
    has_tool_use: bool,

    upstream_error: Option<String>,
}

impl ClaudeStreamHandler {
    pub fn new(model: impl Into<String>, input_tokens: usize) -> Self {
        Self {
            model: model.into(),
            input_tokens,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            conversation_id: None,
            message_start_sent: false,
            block_index: -1,
            open_block: None,
            think_buffer: String::new(),
            in_think_block: false,
            text_out: String::new(),
            thinking_out: String::new(),
            current_tool_id: None,
            tool_input_buffer: String::new(),
            all_tool_inputs: String::new(),
            processed_tool_ids: HashSet::new(),
            has_tool_use: false,
            upstream_error: None,
        }
    }

    pub fn has_upstream_error(&self) -> Option<&str> {
        self.upstream_error.as_deref()
    }

    fn close_open_block(&mut self, out: &mut Vec<SseEvent>) {
        if self.open_block.take().is_some() {
            out.push(SseEvent::new(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.block_index}),
            ));
        }
    }

    fn open_block(&mut self, kind: BlockKind, out: &mut Vec<SseEvent>) {
        self.close_open_block(out);
        self.block_index += 1;
        let content_block = match kind {
            BlockKind::Text => json!({"type": "text", "text": ""}),
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
            BlockKind::ToolUse => unreachable!("tool blocks open via open_tool_block"),
        };
        out.push(SseEvent::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.open_block = Some(kind);
    }

    fn open_tool_block(&mut self, id: &str, name: &str, out: &mut Vec<SseEvent>) {
        self.close_open_block(out);
        self.block_index += 1;
        out.push(SseEvent::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
            }),
        ));
        self.open_block = Some(BlockKind::ToolUse);
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<SseEvent>) {
        if text.is_empty() {
            return;
        }
        if self.open_block != Some(BlockKind::Text) {
            self.open_block(BlockKind::Text, out);
        }
        self.text_out.push_str(text);
        out.push(SseEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": {"type": "text_delta", "text": text}
            }),
        ));
    }

    fn emit_thinking(&mut self, thinking: &str, out: &mut Vec<SseEvent>) {
        if thinking.is_empty() {
            return;
        }
        if self.open_block != Some(BlockKind::Thinking) {
            self.open_block(BlockKind::Thinking, out);
        }
        self.thinking_out.push_str(thinking);
        out.push(SseEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": {"type": "thinking_delta", "thinking": thinking}
            }),
        ));
    }

    /// Resolve as much of the think buffer as the arrived bytes allow,
    /// retaining at most a partial tag prefix for the next chunk.
    fn consume_think_buffer(&mut self, out: &mut Vec<SseEvent>) {
        while !self.think_buffer.is_empty() {
            if !self.in_think_block {
                match self.think_buffer.find(THINKING_START_TAG) {
                    None => {
                        let pending = pending_tag_suffix(&self.think_buffer, THINKING_START_TAG);
                        let emit_to = self.think_buffer.len() - pending;
                        let emit: String = self.think_buffer[..emit_to].to_string();
                        self.think_buffer = self.think_buffer[emit_to..].to_string();
                        self.emit_text(&emit, out);
                        if pending > 0 {
                            return;
                        }
                    }
                    Some(start) => {
                        let before: String = self.think_buffer[..start].to_string();
                        self.emit_text(&before, out);
                        self.think_buffer =
                            self.think_buffer[start + THINKING_START_TAG.len()..].to_string();
                        self.in_think_block = true;
                    }
                }
                continue;
            }

            match self.think_buffer.find(THINKING_END_TAG) {
                None => {
                    let pending = pending_tag_suffix(&self.think_buffer, THINKING_END_TAG);
                    let emit_to = self.think_buffer.len() - pending;
                    let emit: String = self.think_buffer[..emit_to].to_string();
                    self.think_buffer = self.think_buffer[emit_to..].to_string();
                    self.emit_thinking(&emit, out);
                    if pending > 0 {
                        return;
                    }
                }
                Some(end) => {
                    let inside: String = self.think_buffer[..end].to_string();
                    self.emit_thinking(&inside, out);
                    self.think_buffer =
                        self.think_buffer[end + THINKING_END_TAG.len()..].to_string();
                    if self.open_block == Some(BlockKind::Thinking) {
                        self.close_open_block(out);
                    }
                    self.in_think_block = false;
                }
            }
        }
    }

    fn handle_tool_use(&mut self, ev: &ToolUseEvent, out: &mut Vec<SseEvent>) {
        // Re-opens of an already-finished tool call are duplicates
        if let Some(id) = &ev.tool_use_id {
            if self.processed_tool_ids.contains(id) && self.current_tool_id.is_none() {
                return;
            }
        }

        if let (Some(id), Some(name)) = (&ev.tool_use_id, &ev.name) {
            if self.current_tool_id.is_none() {
                let id = id.clone();
                let name = name.clone();
                self.processed_tool_ids.insert(id.clone());
                self.open_tool_block(&id, &name, out);
                self.current_tool_id = Some(id);
                self.tool_input_buffer.clear();
                self.has_tool_use = true;
            }
        }

        let is_current = self.current_tool_id.is_some()
            && ev
                .tool_use_id
                .as_ref()
                .map(|id| Some(id) == self.current_tool_id.as_ref())
                .unwrap_or(true);

        if is_current {
            if let Some(fragment) = ev.input_fragment() {
                if !fragment.is_empty() {
                    self.tool_input_buffer.push_str(&fragment);
                    out.push(SseEvent::new(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": {"type": "input_json_delta", "partial_json": fragment}
                        }),
                    ));
                }
            }
        }

        if ev.stop && is_current {
            self.all_tool_inputs.push_str(&self.tool_input_buffer);
            self.tool_input_buffer.clear();
            self.close_open_block(out);
            self.current_tool_id = None;
        }
    }

    /// Process one upstream event into zero or more SSE frames.
    pub fn handle_event(&mut self, event: &Event) -> Vec<SseEvent> {
        let mut out = Vec::new();
        match event {
            Event::InitialResponse(ev) => {
                if !self.message_start_sent {
                    self.conversation_id = ev.conversation_id.clone();
                    self.message_start_sent = true;
                    out.push(SseEvent::new(
                        "message_start",
                        json!({
                            "type": "message_start",
                            "message": {
                                "id": self.message_id,
                                "type": "message",
                                "role": "assistant",
                                "model": self.model,
                                "content": [],
                                "stop_reason": null,
                                "stop_sequence": null,
                                "usage": {"input_tokens": self.input_tokens, "output_tokens": 0}
                            }
                        }),
                    ));
                    out.push(SseEvent::new("ping", json!({"type": "ping"})));
                }
            }
            Event::AssistantResponse(ev) => {
                // A text fragment ends any in-flight tool block
                if self.current_tool_id.is_some() {
                    self.close_open_block(&mut out);
                    self.current_tool_id = None;
                }
                if !ev.content.is_empty() {
                    self.think_buffer.push_str(&ev.content);
                    self.consume_think_buffer(&mut out);
                }
            }
            Event::ToolUse(ev) => self.handle_tool_use(ev, &mut out),
            Event::ResponseEnd => self.close_open_block(&mut out),
            Event::Error {
                error_code,
                error_message,
            } => {
                tracing::error!("Upstream error event: {} {}", error_code, error_message);
                self.upstream_error = Some(format!("{}: {}", error_code, error_message));
            }
            Event::Exception {
                exception_type,
                message,
            } => {
                tracing::error!("Upstream exception event: {} {}", exception_type, message);
                self.upstream_error = Some(format!("{}: {}", exception_type, message));
            }
            Event::Unknown => {}
        }
        out
    }

    /// Output tokens emitted so far (text + thinking + tool arguments).
    pub fn output_tokens(&self, multiplier: f64) -> usize {
        let raw = count_tokens(&self.text_out)
            + count_tokens(&self.thinking_out)
            + count_tokens(&self.all_tool_inputs);
        (raw as f64 * multiplier) as usize
    }

    pub fn stop_reason(&self) -> &'static str {
        if self.has_tool_use { "tool_use" } else { "end_turn" }
    }

    /// Terminal frames: trailing block close, `message_delta` with stop
    /// reason and usage, `message_stop`.
    pub fn finish(&mut self, multiplier: f64) -> Vec<SseEvent> {
        let mut out = Vec::new();

        // An unterminated thinking region still counts as thinking output
        if !self.think_buffer.is_empty() {
            let rest = std::mem::take(&mut self.think_buffer);
            if self.in_think_block {
                self.emit_thinking(&rest, &mut out);
            } else {
                self.emit_text(&rest, &mut out);
            }
        }
        self.close_open_block(&mut out);

        out.push(SseEvent::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": self.stop_reason(), "stop_sequence": null},
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": self.output_tokens(multiplier)
                }
            }),
        ));
        out.push(SseEvent::new("message_stop", json!({"type": "message_stop"})));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amazonq::model::events::{AssistantResponseEvent, InitialResponseEvent};

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

    fn tool_use(id: Option<&str>, name: Option<&str>, input: Option<serde_json::Value>, stop: bool) -> Event {
        Event::ToolUse(ToolUseEvent {
            tool_use_id: id.map(String::from),
            name: name.map(String::from),
            input,
            stop,
        })
    }

    fn run(events: Vec<Event>) -> (Vec<SseEvent>, ClaudeStreamHandler) {
        let mut handler = ClaudeStreamHandler::new("claude-opus-4.5", 10);
        let mut out = Vec::new();
        for event in &events {
            out.extend(handler.handle_event(event));
        }
        out.extend(handler.finish(1.0));
        (out, handler)
    }

    fn names(events: &[SseEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event.as_str()).collect()
    }

    #[test]
    fn test_basic_text_sequence() {
        let (out, handler) = run(vec![
            initial("cid"),
            assistant("hello"),
            Event::ResponseEnd,
        ]);
        assert_eq!(
            names(&out),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(handler.conversation_id.as_deref(), Some("cid"));
        assert_eq!(handler.stop_reason(), "end_turn");
        assert_eq!(out[0].data["message"]["usage"]["input_tokens"], 10);
    }

    #[test]
    fn test_duplicate_message_start_suppressed() {
        let (out, _) = run(vec![initial("a"), initial("b"), Event::ResponseEnd]);
        assert_eq!(
            names(&out)
                .iter()
                .filter(|n| **n == "message_start")
                .count(),
            1
        );
    }

    #[test]
    fn test_thinking_stripped_into_thinking_deltas() {
        let (out, _) = run(vec![
            initial("cid"),
            assistant("before <thinking>inner</thinking>\n\nafter"),
            Event::ResponseEnd,
        ]);

        let text: String = out
            .iter()
            .filter(|e| e.data["delta"]["type"] == "text_delta")
            .map(|e| e.data["delta"]["text"].as_str().unwrap().to_string())
            .collect();
        let thinking: String = out
            .iter()
            .filter(|e| e.data["delta"]["type"] == "thinking_delta")
            .map(|e| e.data["delta"]["thinking"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(text, "before \n\nafter");
        assert_eq!(thinking, "inner");
    }

    #[test]
    fn test_thinking_tag_split_across_chunks() {
        let (out, _) = run(vec![
            initial("cid"),
            assistant("ab<thin"),
            assistant("king>hidden</think"),
            assistant("ing>cd"),
            Event::ResponseEnd,
        ]);

        let text: String = out
            .iter()
            .filter(|e| e.data["delta"]["type"] == "text_delta")
            .map(|e| e.data["delta"]["text"].as_str().unwrap().to_string())
            .collect();
        let thinking: String = out
            .iter()
            .filter(|e| e.data["delta"]["type"] == "thinking_delta")
            .map(|e| e.data["delta"]["thinking"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(text, "abcd");
        assert_eq!(thinking, "hidden");
    }

    #[test]
    fn test_tool_call_assembly() {
        let (out, handler) = run(vec![
            initial("cid"),
            assistant("calling "),
            tool_use(Some("call_1"), Some("get_weather"), Some(serde_json::json!({"city": "sf"})), false),
            tool_use(Some("call_1"), None, Some(serde_json::json!({"unit": "c"})), false),
            tool_use(Some("call_1"), None, None, true),
            Event::ResponseEnd,
        ]);

        assert_eq!(handler.stop_reason(), "tool_use");

        let start = out
            .iter()
            .find(|e| e.data["content_block"]["type"] == "tool_use")
            .expect("tool_use block start");
        assert_eq!(start.data["content_block"]["id"], "call_1");
        assert_eq!(start.data["content_block"]["name"], "get_weather");
        assert_eq!(start.data["index"], 1); // text block was index 0

        let fragments: Vec<String> = out
            .iter()
            .filter(|e| e.data["delta"]["type"] == "input_json_delta")
            .map(|e| e.data["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(fragments, vec![r#"{"city":"sf"}"#, r#"{"unit":"c"}"#]);
    }

    #[test]
    fn test_duplicate_tool_open_ignored() {
        let (out, _) = run(vec![
            initial("cid"),
            tool_use(Some("c1"), Some("t"), None, false),
            tool_use(Some("c1"), None, None, true),
            tool_use(Some("c1"), Some("t"), None, false), // re-open of closed id
            Event::ResponseEnd,
        ]);
        let starts = out
            .iter()
            .filter(|e| e.event == "content_block_start")
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_upstream_error_recorded() {
        let mut handler = ClaudeStreamHandler::new("m", 0);
        handler.handle_event(&Event::Error {
            error_code: "ThrottlingException".into(),
            error_message: "slow down".into(),
        });
        assert!(handler.has_upstream_error().unwrap().contains("ThrottlingException"));
    }

    #[test]
    fn test_output_token_multiplier() {
        let (_, handler) = run(vec![
            initial("cid"),
            assistant("one two three four five six"),
            Event::ResponseEnd,
        ]);
        let base = handler.output_tokens(1.0);
        assert!(base > 0);
        assert_eq!(handler.output_tokens(2.0), base * 2);
    }
}

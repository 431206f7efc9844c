//! Upstream events → OpenAI chat.completion.chunk frames
//!
//! Thinking regions are discarded on this surface (the dialect has no
//! channel for them); tool calls stream as `tool_calls` deltas with sticky
//! indices; the terminator carries `finish_reason` and usage.

use serde_json::{Value, json};
use std::collections::HashSet;

use crate::amazonq::model::events::{Event, ToolUseEvent};
use crate::core::tokenizer::count_tokens;

const THINKING_START_TAG: &str = "<thinking>";
const THINKING_END_TAG: &str = "</thinking>";

/// Longest prefix of `tag` the buffer ends with.
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

/// Removes `<thinking>…</thinking>` regions from a chunked text stream.
#[derive(Default)]
pub struct ThinkingStripper {
    buffer: String,
    in_think: bool,
}

impl ThinkingStripper {
    /// Feed a chunk; returns the visible text resolved so far.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.buffer.is_empty() {
                break;
            }
            if !self.in_think {
                match self.buffer.find(THINKING_START_TAG) {
                    None => {
                        let pending = pending_tag_suffix(&self.buffer, THINKING_START_TAG);
                        let emit_to = self.buffer.len() - pending;
                        out.push_str(&self.buffer[..emit_to]);
                        self.buffer = self.buffer[emit_to..].to_string();
                        break;
                    }
                    Some(start) => {
                        out.push_str(&self.buffer[..start]);
                        self.buffer = self.buffer[start + THINKING_START_TAG.len()..].to_string();
                        self.in_think = true;
                    }
                }
            } else {
                match self.buffer.find(THINKING_END_TAG) {
                    None => {
                        let pending = pending_tag_suffix(&self.buffer, THINKING_END_TAG);
                        // Hidden text is dropped; only a tag prefix is kept
                        self.buffer = self.buffer[self.buffer.len() - pending..].to_string();
                        break;
                    }
                    Some(end) => {
                        self.buffer = self.buffer[end + THINKING_END_TAG.len()..].to_string();
                        self.in_think = false;
                    }
                }
            }
        }
        out
    }

    /// Stream end: any pending visible text flushes; hidden text stays dropped.
    pub fn flush(&mut self) -> String {
        if self.in_think {
            self.buffer.clear();
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }
}

pub struct OpenAiStreamHandler {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,

    stripper: ThinkingStripper,
    text_out: String,

    current_tool_id: Option<String>,
    tool_index: i64,
    processed_tool_ids: HashSet<String>,
    all_tool_args: String,
    has_tool_use: bool,

    upstream_error: Option<String>,
}

impl OpenAiStreamHandler {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            stripper: ThinkingStripper::default(),
            text_out: String::new(),
            current_tool_id: None,
            tool_index: -1,
            processed_tool_ids: HashSet::new(),
            all_tool_args: String::new(),
            has_tool_use: false,
            upstream_error: None,
        }
    }

    pub fn has_upstream_error(&self) -> Option<&str> {
        self.upstream_error.as_deref()
    }

    fn chunk(&self, delta: Value, finish_reason: Value) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        })
    }

    fn role_chunk(&mut self, out: &mut Vec<Value>) {
        if !self.role_sent {
            self.role_sent = true;
            out.push(self.chunk(json!({"role": "assistant"}), Value::Null));
        }
    }

    fn handle_tool_use(&mut self, ev: &ToolUseEvent, out: &mut Vec<Value>) {
        if let Some(id) = &ev.tool_use_id {
            if self.processed_tool_ids.contains(id) && self.current_tool_id.is_none() {
                return;
            }
        }

        if let (Some(id), Some(name)) = (&ev.tool_use_id, &ev.name) {
            if self.current_tool_id.is_none() {
                self.role_chunk(out);
                self.processed_tool_ids.insert(id.clone());
                self.tool_index += 1;
                self.has_tool_use = true;
                self.current_tool_id = Some(id.clone());
                out.push(self.chunk(
                    json!({"tool_calls": [{
                        "index": self.tool_index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""}
                    }]}),
                    Value::Null,
                ));
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
                    self.all_tool_args.push_str(&fragment);
                    out.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": self.tool_index,
                            "function": {"arguments": fragment}
                        }]}),
                        Value::Null,
                    ));
                }
            }
        }

        if ev.stop && is_current {
            self.current_tool_id = None;
        }
    }

    /// Process one upstream event into zero or more chunk frames.
    pub fn handle_event(&mut self, event: &Event) -> Vec<Value> {
        let mut out = Vec::new();
        match event {
            Event::InitialResponse(_) => self.role_chunk(&mut out),
            Event::AssistantResponse(ev) => {
                self.current_tool_id = None;
                let visible = self.stripper.feed(&ev.content);
                if !visible.is_empty() {
                    self.role_chunk(&mut out);
                    self.text_out.push_str(&visible);
                    out.push(self.chunk(json!({"content": visible}), Value::Null));
                }
            }
            Event::ToolUse(ev) => self.handle_tool_use(ev, &mut out),
            Event::ResponseEnd => {}
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

    pub fn finish_reason(&self) -> &'static str {
        if self.has_tool_use { "tool_calls" } else { "stop" }
    }

    pub fn output_tokens(&self, multiplier: f64) -> usize {
        let raw = count_tokens(&self.text_out) + count_tokens(&self.all_tool_args);
        (raw as f64 * multiplier) as usize
    }

    /// Terminator chunk with finish_reason and usage.
    pub fn finish(&mut self, input_tokens: usize, multiplier: f64) -> Vec<Value> {
        let mut out = Vec::new();
        let rest = self.stripper.flush();
        if !rest.is_empty() {
            self.role_chunk(&mut out);
            self.text_out.push_str(&rest);
            out.push(self.chunk(json!({"content": rest}), Value::Null));
        }
        self.role_chunk(&mut out);

        let completion_tokens = self.output_tokens(multiplier);
        let mut terminal = self.chunk(json!({}), json!(self.finish_reason()));
        terminal["usage"] = json!({
            "prompt_tokens": input_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": input_tokens + completion_tokens
        });
        out.push(terminal);
        out
    }

    /// Accumulated visible text (non-streaming aggregation).
    pub fn text(&self) -> &str {
        &self.text_out
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> i64 {
        self.created
    }
}

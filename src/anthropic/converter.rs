//! Anthropic → Amazon Q request conversion
//!
//! Builds the `conversationState` body: system prompt and user text are
//! wrapped in marker sections, history is normalized to strict
//! user/assistant alternation, tool results are merged by id, and images
//! are pruned down to the last two user messages that carry any.

use serde_json::Value;
use thiserror::Error;

use crate::amazonq::model::requests::conversation::{
    ChatRequestBody, ConversationState, HistoryAssistantMessage, HistoryUserMessage, Message as QMessage,
    QImage, UserInputMessage, UserInputMessageContext,
};
use crate::amazonq::model::requests::tool::{
    InputSchema, Tool, ToolResult, ToolResultContent, ToolSpecification, ToolUseEntry,
};

use super::types::{ContentBlock, MessageContent, MessagesRequest, is_thinking_mode_enabled};

pub const THINKING_HINT: &str =
    "<thinking_mode>interleaved</thinking_mode><max_thinking_length>16000</max_thinking_length>";
const THINKING_START_TAG: &str = "<thinking>";
const THINKING_END_TAG: &str = "</thinking>";

/// Tool descriptions beyond this move to the TOOL DOCUMENTATION section
const TOOL_DESCRIPTION_LIMIT: usize = 10 * 1024;
const TOOL_DESCRIPTION_KEEP: usize = 10_100;

const CANCELLED_TOOL_RESULT: &str = "Tool use was cancelled by the user";

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("message list is empty")]
    EmptyMessages,
    #[error("history validation failed: {0}")]
    HistoryValidation(String),
}

/// Conversion context
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub conversation_id: String,
    pub model_id: String,
    pub client_os: String,
    pub client_cwd: String,
    /// Strict mode raises on alternation/tool-pairing violations
    pub strict: bool,
}

fn wrap_thinking(text: &str) -> String {
    format!("{}{}{}", THINKING_START_TAG, text, THINKING_END_TAG)
}

/// Amazon Q timestamp: `Weekday, ISO-8601-with-millis`.
pub fn current_timestamp() -> String {
    let now = chrono::Local::now();
    format!("{}, {}", now.format("%A"), now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
}

fn image_format(media_type: &str) -> Option<&'static str> {
    match media_type {
        "image/jpeg" => Some("jpeg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Text from content: text blocks joined, thinking blocks re-wrapped.
fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.clone()),
                    ContentBlock::Thinking { thinking } => parts.push(wrap_thinking(thinking)),
                    _ => {}
                }
            }
            parts.join("\n")
        }
    }
}

fn extract_images(content: &MessageContent) -> Vec<QImage> {
    let MessageContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Image { source } if source.source_type == "base64" => {
                let format = image_format(&source.media_type).unwrap_or("png");
                Some(QImage::from_base64(format, source.data.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Tool-result content in the upstream shape; empty content becomes the
/// cancelled-by-user placeholder.
fn tool_result_content(raw: &Option<Value>) -> Vec<ToolResultContent> {
    let mut out = Vec::new();
    match raw {
        Some(Value::String(s)) => out.push(ToolResultContent::text(s.clone())),
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(s) => out.push(ToolResultContent::text(s.clone())),
                    Value::Object(obj) => {
                        if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                            out.push(ToolResultContent::text(text));
                        }
                    }
                    _ => {}
                }
            }
        }
        Some(other) => out.push(ToolResultContent::text(other.to_string())),
        None => {}
    }

    if !out.iter().any(|c| !c.text.trim().is_empty()) {
        out = vec![ToolResultContent::text(CANCELLED_TOOL_RESULT)];
    }
    out
}

/// Tool results from a block list, merged by toolUseId (duplicate ids
/// concatenate content; the first status wins).
fn extract_tool_results(content: &MessageContent) -> Vec<ToolResult> {
    let MessageContent::Blocks(blocks) = content else {
        return Vec::new();
    };

    let mut results: Vec<ToolResult> = Vec::new();
    for block in blocks {
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
            status,
        } = block
        else {
            continue;
        };
        let chunk = tool_result_content(content);
        let status = status
            .clone()
            .or_else(|| is_error.map(|e| if e { "error" } else { "success" }.to_string()))
            .unwrap_or_else(|| "success".to_string());

        match results.iter_mut().find(|r| r.tool_use_id == *tool_use_id) {
            Some(existing) => existing.content.extend(chunk),
            None => {
                results.push(ToolResult::new(tool_use_id.clone(), chunk).with_status(status));
            }
        }
    }
    results
}

/// Convert a tool definition; oversized descriptions are truncated and the
/// full text returned for the documentation section.
fn convert_tool(tool: &super::types::ToolDefinition) -> (Tool, Option<(String, String)>) {
    let description = tool.description.clone().unwrap_or_default();
    let (short_desc, long_doc) = if description.len() > TOOL_DESCRIPTION_LIMIT {
        let mut keep = TOOL_DESCRIPTION_KEEP.min(description.len());
        while !description.is_char_boundary(keep) {
            keep -= 1;
        }
        (
            format!(
                "{}\n\n...(Full description provided in TOOL DOCUMENTATION section)",
                &description[..keep]
            ),
            Some((tool.name.clone(), description.clone())),
        )
    } else {
        (description, None)
    };

    let schema = if tool.input_schema.is_object() {
        tool.input_schema.clone()
    } else {
        serde_json::json!({"type": "object", "properties": {}})
    };

    (
        Tool {
            tool_specification: ToolSpecification {
                name: tool.name.clone(),
                description: short_desc,
                input_schema: InputSchema::from_json(schema),
            },
        },
        long_doc,
    )
}

/// Merge consecutive user messages into one: contents joined by blank
/// lines, tool results concatenated by id, only the last two messages'
/// images retained.
pub fn merge_user_messages(messages: Vec<UserInputMessage>) -> UserInputMessage {
    let mut contents: Vec<String> = Vec::new();
    let mut base_context: Option<UserInputMessageContext> = None;
    let mut base_origin: Option<String> = None;
    let mut base_model: Option<String> = None;
    let mut all_tool_results: Vec<ToolResult> = Vec::new();
    let mut image_groups: Vec<Vec<QImage>> = Vec::new();

    for mut msg in messages {
        let mut ctx = std::mem::take(&mut msg.user_input_message_context);
        all_tool_results.append(&mut ctx.tool_results);
        if base_context.is_none() {
            base_context = Some(ctx);
        }
        if base_origin.is_none() {
            base_origin = msg.origin.clone();
        }
        if base_model.is_none() {
            base_model = msg.model_id.clone();
        }
        if !msg.content.is_empty() {
            contents.push(msg.content);
        }
        if !msg.images.is_empty() {
            image_groups.push(msg.images);
        }
    }

    let mut context = base_context.unwrap_or_default();
    if !all_tool_results.is_empty() {
        let mut merged: Vec<ToolResult> = Vec::new();
        for result in all_tool_results {
            match merged.iter_mut().find(|r| r.tool_use_id == result.tool_use_id) {
                Some(existing) => {
                    existing.content.extend(result.content);
                    if existing.status.is_none() {
                        existing.status = result.status;
                    }
                }
                None => merged.push(result),
            }
        }
        context.tool_results = merged;
    }

    let images: Vec<QImage> = image_groups
        .split_off(image_groups.len().saturating_sub(2))
        .into_iter()
        .flatten()
        .collect();

    UserInputMessage {
        content: contents.join("\n\n"),
        user_input_message_context: context,
        model_id: base_model,
        images,
        origin: base_origin.or_else(|| Some("KIRO_CLI".to_string())),
    }
}

fn role_of(item: &QMessage) -> &'static str {
    if item.is_user() { "user" } else { "assistant" }
}

fn validate_history_alternation(history: &[QMessage], strict: bool) -> Result<(), ConversionError> {
    let mut last: Option<(&'static str, usize)> = None;
    for (idx, item) in history.iter().enumerate() {
        let role = role_of(item);
        if let Some((prev_role, prev_idx)) = last {
            if prev_role == role {
                let msg = format!(
                    "history alternation violated: prev_idx={}, idx={}, role={}",
                    prev_idx, idx, role
                );
                if strict {
                    return Err(ConversionError::HistoryValidation(msg));
                }
                tracing::warn!("{}", msg);
            }
        }
        last = Some((role, idx));
    }
    Ok(())
}

fn validate_tool_results_follow_tool_uses(
    history: &[QMessage],
    strict: bool,
) -> Result<(), ConversionError> {
    let mut last_assistant: Option<(usize, Vec<String>)> = None;
    for (idx, item) in history.iter().enumerate() {
        match item {
            QMessage::Assistant(_) => {
                last_assistant = Some((idx, item.tool_use_ids()));
            }
            QMessage::User(_) => {
                let result_ids = item.tool_use_ids();
                if result_ids.is_empty() {
                    continue;
                }
                let ok = last_assistant
                    .as_ref()
                    .map(|(_, use_ids)| result_ids.iter().all(|id| use_ids.contains(id)))
                    .unwrap_or(false);
                if !ok {
                    let msg = format!(
                        "toolResults order violated: prev_idx={:?}, idx={}, ids={:?}",
                        last_assistant.as_ref().map(|(i, _)| *i),
                        idx,
                        result_ids
                    );
                    if strict {
                        return Err(ConversionError::HistoryValidation(msg));
                    }
                    tracing::warn!("{}", msg);
                }
            }
        }
    }
    Ok(())
}

/// Convert the history portion into alternating Amazon Q entries.
fn process_history(
    messages: &[super::types::Message],
    opts: &ConvertOptions,
) -> Result<Vec<QMessage>, ConversionError> {
    let mut seen_tool_use_ids: std::collections::HashSet<String> = Default::default();
    let mut raw: Vec<QMessage> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "user" => {
                let text = match &msg.content {
                    MessageContent::Text(text) => text.clone(),
                    MessageContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                let tool_results = extract_tool_results(&msg.content);
                let images = extract_images(&msg.content);

                let mut context =
                    UserInputMessageContext::with_env(&opts.client_os, &opts.client_cwd);
                context.tool_results = tool_results;

                let user = UserInputMessage {
                    content: text,
                    user_input_message_context: context,
                    model_id: None,
                    images,
                    origin: Some("KIRO_CLI".to_string()),
                };
                raw.push(QMessage::User(HistoryUserMessage {
                    user_input_message: user,
                }));
            }
            "assistant" => {
                let text = extract_text(&msg.content);
                let mut tool_uses = Vec::new();
                if let MessageContent::Blocks(blocks) = &msg.content {
                    for block in blocks {
                        if let ContentBlock::ToolUse { id, name, input } = block {
                            if seen_tool_use_ids.insert(id.clone()) {
                                tool_uses.push(ToolUseEntry {
                                    tool_use_id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                });
                            }
                        }
                    }
                }
                let assistant = crate::amazonq::model::requests::conversation::AssistantMessage::new(
                    text,
                )
                .with_tool_uses(tool_uses);
                raw.push(QMessage::Assistant(HistoryAssistantMessage {
                    assistant_response_message: assistant,
                }));
            }
            // system entries never appear in Anthropic history; drop others
            _ => {}
        }
    }

    // Merge consecutive user messages; a user turn carrying tool results
    // flushes any pending group first so results stay next to their uses
    let mut history: Vec<QMessage> = Vec::new();
    let mut pending: Vec<UserInputMessage> = Vec::new();
    for item in raw {
        match item {
            QMessage::User(user) => {
                let has_tool_results = !user
                    .user_input_message
                    .user_input_message_context
                    .tool_results
                    .is_empty();
                if has_tool_results {
                    if !pending.is_empty() {
                        history.push(QMessage::User(HistoryUserMessage {
                            user_input_message: merge_user_messages(std::mem::take(&mut pending)),
                        }));
                    }
                    history.push(QMessage::User(user));
                } else {
                    pending.push(user.user_input_message);
                }
            }
            assistant @ QMessage::Assistant(_) => {
                if !pending.is_empty() {
                    history.push(QMessage::User(HistoryUserMessage {
                        user_input_message: merge_user_messages(std::mem::take(&mut pending)),
                    }));
                }
                history.push(assistant);
            }
        }
    }
    if !pending.is_empty() {
        history.push(QMessage::User(HistoryUserMessage {
            user_input_message: merge_user_messages(pending),
        }));
    }

    // Second pass: collapse user runs the flush above can still produce
    // (tool-result turns adjacent to plain turns)
    let mut processed: Vec<QMessage> = Vec::new();
    let mut pending: Vec<UserInputMessage> = Vec::new();
    for item in history {
        match item {
            QMessage::User(user) => pending.push(user.user_input_message),
            assistant @ QMessage::Assistant(_) => {
                if !pending.is_empty() {
                    processed.push(QMessage::User(HistoryUserMessage {
                        user_input_message: merge_user_messages(std::mem::take(&mut pending)),
                    }));
                }
                processed.push(assistant);
            }
        }
    }
    if !pending.is_empty() {
        processed.push(QMessage::User(HistoryUserMessage {
            user_input_message: merge_user_messages(pending),
        }));
    }

    validate_history_alternation(&processed, opts.strict)?;
    validate_tool_results_follow_tool_uses(&processed, opts.strict)?;
    Ok(processed)
}

/// Boundary merge: a trailing history user message folds into the current
/// message, keeping the current message's own context (tools stay attached
/// to the send) while inheriting merged tool results.
fn merge_preserving_current_context(
    prev: UserInputMessage,
    current: UserInputMessage,
) -> UserInputMessage {
    let current_context = current.user_input_message_context.clone();
    let mut merged = merge_user_messages(vec![prev, current]);
    let tool_results = std::mem::take(&mut merged.user_input_message_context.tool_results);
    merged.user_input_message_context = current_context;
    if !tool_results.is_empty() {
        merged.user_input_message_context.tool_results = tool_results;
    }
    merged
}

/// Keep images only on the last two user messages (history + current).
fn prune_images(history: &mut [QMessage], current: &mut UserInputMessage) {
    let mut holders: Vec<&mut Vec<QImage>> = Vec::new();
    for item in history.iter_mut() {
        if let QMessage::User(user) = item {
            if !user.user_input_message.images.is_empty() {
                holders.push(&mut user.user_input_message.images);
            }
        }
    }
    if !current.images.is_empty() {
        holders.push(&mut current.images);
    }
    let excess = holders.len().saturating_sub(2);
    for images in holders.into_iter().take(excess) {
        images.clear();
    }
}

fn append_thinking_hint(text: &str) -> String {
    if text.is_empty() {
        return THINKING_HINT.to_string();
    }
    if text.contains(THINKING_HINT) {
        return text.to_string();
    }
    let separator = if text.ends_with('\n') || text.ends_with('\r') {
        ""
    } else {
        "\n"
    };
    format!("{}{}{}", text, separator, THINKING_HINT)
}

/// Convert a Messages request into the Amazon Q body.
pub fn convert_request(
    req: &MessagesRequest,
    opts: &ConvertOptions,
) -> Result<ChatRequestBody, ConversionError> {
    if req.messages.is_empty() {
        return Err(ConversionError::EmptyMessages);
    }

    // 1. Tools (oversized descriptions feed the documentation section)
    let mut tools = Vec::new();
    let mut long_docs = Vec::new();
    if let Some(defs) = &req.tools {
        for def in defs {
            let (tool, long_doc) = convert_tool(def);
            tools.push(tool);
            if let Some(doc) = long_doc {
                long_docs.push(doc);
            }
        }
    }

    // 2. Current message (the trailing user turn)
    let last = req.messages.last().unwrap();
    let (prompt_text, tool_results, images) = if last.role == "user" {
        (
            extract_text(&last.content),
            extract_tool_results(&last.content),
            extract_images(&last.content),
        )
    } else {
        (String::new(), Vec::new(), Vec::new())
    };
    let has_tool_result = !tool_results.is_empty();
    let prompt_text = prompt_text.trim().to_string();

    // 3. Context
    let mut context = UserInputMessageContext::with_env(&opts.client_os, &opts.client_cwd);
    context.tools = tools;
    context.tool_results = tool_results;

    // 4. Marker-formatted content
    let now_stamp = current_timestamp();
    let mut formatted = if has_tool_result && prompt_text.is_empty() {
        String::new()
    } else {
        format!(
            "--- CONTEXT ENTRY BEGIN ---\nCurrent time: {}\n--- CONTEXT ENTRY END ---\n\n--- USER MESSAGE BEGIN ---\n{}\n--- USER MESSAGE END ---",
            now_stamp, prompt_text
        )
    };

    if !long_docs.is_empty() {
        let mut docs = String::new();
        for (name, full) in &long_docs {
            docs.push_str(&format!("Tool: {}\nFull Description:\n{}\n", name, full));
        }
        let tool_docs = format!(
            "--- TOOL DOCUMENTATION BEGIN ---\n{}--- TOOL DOCUMENTATION END ---\n\n",
            docs
        );
        formatted = if formatted.is_empty() {
            format!(
                "{}--- CONTEXT ENTRY BEGIN ---\nCurrent time: {}\n--- CONTEXT ENTRY END ---",
                tool_docs, now_stamp
            )
        } else {
            format!("{}{}", tool_docs, formatted)
        };
    }

    if let Some(system) = &req.system {
        let sys_text = system.to_text();
        let sys_text = sys_text.trim();
        if !sys_text.is_empty() {
            formatted = format!(
                "--- SYSTEM PROMPT BEGIN ---\n{}\n--- SYSTEM PROMPT END ---\n\n{}",
                sys_text, formatted
            );
        }
    }

    if is_thinking_mode_enabled(req.thinking.as_ref()) && !formatted.is_empty() {
        formatted = append_thinking_hint(&formatted);
    }

    // 5. Current user input message
    let mut current = UserInputMessage {
        content: formatted,
        user_input_message_context: context,
        model_id: Some(opts.model_id.clone()),
        images,
        origin: Some("KIRO_CLI".to_string()),
    };

    // 6. History (everything before the last message)
    let history_slice: &[super::types::Message] = if req.messages.len() > 1 {
        &req.messages[..req.messages.len() - 1]
    } else {
        &[]
    };
    let mut history = process_history(history_slice, opts)?;

    // 7. A trailing user entry merges into the current message
    if matches!(history.last(), Some(QMessage::User(_))) {
        if let Some(QMessage::User(prev)) = history.pop() {
            current = merge_preserving_current_context(prev.user_input_message, current);
        }
    }

    // 8. Image budget
    prune_images(&mut history, &mut current);

    Ok(ChatRequestBody {
        conversation_state: ConversationState::new(opts.conversation_id.clone(), current)
            .with_history(history),
    })
}

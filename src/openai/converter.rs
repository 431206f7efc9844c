//! OpenAI → neutral request conversion
//!
//! Normalizes the Chat Completions surface (content parts, tool_calls,
//! legacy functions, attachments) into the same internal message form the
//! Anthropic path uses, so one converter produces the Amazon Q body.

use serde_json::Value;

use crate::anthropic::types::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Metadata, SystemField,
    ToolDefinition,
};

use super::types::{ChatCompletionRequest, ChatMessage};

/// `data:<media_type>;base64,<payload>` → (media_type, payload)
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    if payload.is_empty() {
        return None;
    }
    Some((media_type.to_string(), payload.to_string()))
}

fn image_block(media_type: String, data: String) -> ContentBlock {
    ContentBlock::Image {
        source: ImageSource {
            source_type: "base64".to_string(),
            media_type,
            data,
        },
    }
}

/// Extract text and image blocks from an OpenAI content value.
fn content_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
        Value::Array(parts) => {
            let mut blocks = Vec::new();
            for part in parts {
                let part_type = part.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match part_type {
                    "text" => {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            blocks.push(ContentBlock::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    "image_url" | "input_image" | "image" => {
                        let url = part
                            .get("image_url")
                            .and_then(|iu| iu.get("url"))
                            .or_else(|| part.get("image_url"))
                            .or_else(|| part.get("url"))
                            .and_then(|v| v.as_str());
                        if let Some((media_type, data)) = url.and_then(parse_data_url) {
                            blocks.push(image_block(media_type, data));
                        }
                    }
                    _ => {
                        // Unlabelled parts with a text field still count
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            blocks.push(ContentBlock::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                }
            }
            blocks
        }
        _ => Vec::new(),
    }
}

fn content_text(content: &Value) -> String {
    content_blocks(content)
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Effective tool list after tool_choice / legacy function_call filtering.
fn effective_tools(req: &ChatCompletionRequest) -> Option<Vec<ToolDefinition>> {
    let mut tools: Vec<ToolDefinition> = Vec::new();

    if let Some(defs) = &req.tools {
        tools.extend(defs.iter().map(|t| ToolDefinition {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            input_schema: t
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        }));
    }
    if let Some(defs) = &req.functions {
        tools.extend(defs.iter().map(|f| ToolDefinition {
            name: f.name.clone(),
            description: f.description.clone(),
            input_schema: f
                .parameters
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        }));
    }
    if tools.is_empty() {
        return None;
    }

    let choice = req.tool_choice.as_ref().or(req.function_call.as_ref());
    match choice {
        Some(Value::String(s)) if s == "none" => None,
        Some(Value::Object(obj)) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| obj.get("name"))
                .and_then(|v| v.as_str());
            match name {
                Some(name) => {
                    let filtered: Vec<ToolDefinition> =
                        tools.into_iter().filter(|t| t.name == name).collect();
                    if filtered.is_empty() { None } else { Some(filtered) }
                }
                None => Some(tools),
            }
        }
        _ => Some(tools),
    }
}

/// Arguments string → JSON input; unparseable strings ride along raw.
fn parse_arguments(arguments: Option<&str>) -> Value {
    match arguments {
        None | Some("") => serde_json::json!({}),
        Some(raw) => serde_json::from_str(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn assistant_blocks(msg: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if let Some(content) = &msg.content {
        let text = content_text(content);
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
    }
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone().unwrap_or_default(),
                input: parse_arguments(call.function.arguments.as_deref()),
            });
        }
    }
    // Legacy single function_call gets a synthetic id
    if let Some(call) = &msg.function_call {
        if let Some(name) = &call.name {
            blocks.push(ContentBlock::ToolUse {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: name.clone(),
                input: parse_arguments(call.arguments.as_deref()),
            });
        }
    }
    blocks
}

/// Convert a Chat Completions request into the neutral Messages form.
pub fn to_messages_request(req: &ChatCompletionRequest) -> Result<MessagesRequest, String> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &msg.content {
                    let text = content_text(content);
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
            }
            "user" => {
                let blocks = msg
                    .content
                    .as_ref()
                    .map(content_blocks)
                    .unwrap_or_default();
                messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(blocks),
                });
            }
            "assistant" => {
                messages.push(Message {
                    role: "assistant".to_string(),
                    content: MessageContent::Blocks(assistant_blocks(msg)),
                });
            }
            "tool" | "function" => {
                let tool_use_id = msg
                    .tool_call_id
                    .clone()
                    .or_else(|| msg.name.clone())
                    .ok_or_else(|| "tool message missing tool_call_id".to_string())?;
                let content = msg
                    .content
                    .as_ref()
                    .map(|c| Value::String(content_text(c)))
                    .unwrap_or(Value::Null);
                messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id,
                        content: Some(content),
                        is_error: None,
                        status: None,
                    }]),
                });
            }
            other => return Err(format!("unsupported message role: {}", other)),
        }
    }

    if messages.is_empty() {
        return Err("message list is empty".to_string());
    }

    // Attachment data-URLs join the last user message as image blocks
    if let Some(attachments) = &req.attachments {
        let images: Vec<ContentBlock> = attachments
            .iter()
            .filter_map(|a| {
                if let Some(url) = &a.url {
                    parse_data_url(url).map(|(mt, data)| image_block(mt, data))
                } else {
                    a.data.as_ref().map(|data| {
                        image_block(
                            a.mime_type.clone().unwrap_or_else(|| "image/png".into()),
                            data.clone(),
                        )
                    })
                }
            })
            .collect();
        if !images.is_empty() {
            if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") {
                if let MessageContent::Blocks(blocks) = &mut last_user.content {
                    blocks.extend(images);
                }
            }
        }
    }

    Ok(MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens,
        messages,
        stream: req.stream,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(SystemField::Text(system_parts.join("\n\n")))
        },
        tools: effective_tools(req),
        tool_choice: req.tool_choice.clone(),
        thinking: None,
        temperature: req.temperature,
        conversation_id: None,
        metadata: req.user.clone().map(|user_id| Metadata {
            user_id: Some(user_id),
        }),
    })
}

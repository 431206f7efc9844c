//! Anthropic API types

use serde::{Deserialize, Serialize};
use serde_json::Value;

// === Error Response ===

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
                code: None,
            },
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }

    pub fn authentication_error() -> Self {
        Self::new("authentication_error", "Invalid API key")
    }
}

// === Messages Endpoint Types ===

/// Messages request body
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system: Option<SystemField>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    /// Accepts bool, "enabled", or an object; parsed leniently because
    /// clients disagree on the shape
    #[serde(default)]
    pub thinking: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

/// `content` accepts a bare string or a block list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

/// `system` accepts a bare string or `[{type:"text", text}]` blocks
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemField {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type", default)]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

impl SystemField {
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text" || b.block_type.is_empty())
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

// === Count Tokens Endpoint Types ===

#[derive(Debug, Serialize)]
pub struct CountTokensResponse {
    pub input_tokens: i64,
}

// === Models Endpoint Types ===

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub display_name: String,
    pub max_tokens: i64,
    pub context_window: i64,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

/// Fixed list of supported model ids with metadata.
pub fn supported_models() -> Vec<ModelInfo> {
    [
        ("claude-sonnet-4", "Claude Sonnet 4"),
        ("claude-sonnet-4.5", "Claude Sonnet 4.5"),
        ("claude-haiku-4.5", "Claude Haiku 4.5"),
        ("claude-opus-4.5", "Claude Opus 4.5"),
    ]
    .into_iter()
    .map(|(id, name)| ModelInfo {
        id: id.to_string(),
        model_type: "model".to_string(),
        display_name: name.to_string(),
        max_tokens: 64_000,
        context_window: 200_000,
    })
    .collect()
}

/// Thinking mode detection over the lenient `thinking` field.
pub fn is_thinking_mode_enabled(thinking: Option<&Value>) -> bool {
    match thinking {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("enabled"),
        Some(Value::Object(obj)) => {
            if obj
                .get("type")
                .and_then(|v| v.as_str())
                .map(|t| t.eq_ignore_ascii_case("enabled"))
                .unwrap_or(false)
            {
                return true;
            }
            if let Some(Value::Bool(enabled)) = obj.get("enabled") {
                return *enabled;
            }
            obj.get("budget_tokens")
                .and_then(|v| v.as_f64())
                .map(|budget| budget > 0.0)
                .unwrap_or(false)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_accepts_string_and_blocks() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "messages": [
                {"role": "user", "content": "plain text"},
                {"role": "user", "content": [{"type": "text", "text": "block"}]}
            ]
        }))
        .unwrap();

        assert!(matches!(req.messages[0].content, MessageContent::Text(_)));
        assert!(matches!(req.messages[1].content, MessageContent::Blocks(_)));
    }

    #[test]
    fn test_system_accepts_both_shapes() {
        let text: SystemField = serde_json::from_value(json!("be nice")).unwrap();
        assert_eq!(text.to_text(), "be nice");

        let blocks: SystemField =
            serde_json::from_value(json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]))
                .unwrap();
        assert_eq!(blocks.to_text(), "a\nb");
    }

    #[test]
    fn test_conversation_id_alias() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "conversationId": "cid-1"
        }))
        .unwrap();
        assert_eq!(req.conversation_id.as_deref(), Some("cid-1"));
    }

    #[test]
    fn test_unknown_block_tolerated() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type": "server_tool_use", "whatever": 1})).unwrap();
        assert!(matches!(block, ContentBlock::Unknown));
    }

    #[test]
    fn test_thinking_mode_forms() {
        assert!(is_thinking_mode_enabled(Some(&json!(true))));
        assert!(!is_thinking_mode_enabled(Some(&json!(false))));
        assert!(is_thinking_mode_enabled(Some(&json!("enabled"))));
        assert!(!is_thinking_mode_enabled(Some(&json!("off"))));
        assert!(is_thinking_mode_enabled(Some(&json!({"type": "enabled"}))));
        assert!(is_thinking_mode_enabled(Some(&json!({"budget_tokens": 1024}))));
        assert!(!is_thinking_mode_enabled(Some(&json!({"budget_tokens": 0}))));
        assert!(is_thinking_mode_enabled(Some(&json!({"enabled": true}))));
        assert!(!is_thinking_mode_enabled(None));
    }
}

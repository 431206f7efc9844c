//! Conversation wire types
//!
//! `conversationState` is the neutral request form every inbound dialect
//! translates into.

use serde::{Deserialize, Serialize};

use super::tool::{Tool, ToolResult, ToolUseEntry};

/// Top-level request body: `{"conversationState": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub conversation_state: ConversationState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,
    pub current_message: CurrentMessage,
    pub chat_trigger_type: String,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>, current: UserInputMessage) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            history: Vec::new(),
            current_message: CurrentMessage {
                user_input_message: current,
            },
            // "AUTO" is rejected upstream with 400
            chat_trigger_type: "MANUAL".to_string(),
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

/// History entry: user or assistant side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    User(HistoryUserMessage),
    Assistant(HistoryAssistantMessage),
}

impl Message {
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant(_))
    }

    /// toolUseIds carried by this entry: uses on the assistant side,
    /// results on the user side.
    pub fn tool_use_ids(&self) -> Vec<String> {
        match self {
            Self::User(user) => user
                .user_input_message
                .user_input_message_context
                .tool_results
                .iter()
                .map(|r| r.tool_use_id.clone())
                .collect(),
            Self::Assistant(assistant) => assistant
                .assistant_response_message
                .tool_uses
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|u| u.tool_use_id.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryUserMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryAssistantMessage {
    pub assistant_response_message: AssistantMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "is_default_context")]
    pub user_input_message_context: UserInputMessageContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<QImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

fn is_default_context(ctx: &UserInputMessageContext) -> bool {
    ctx.tools.is_empty() && ctx.tool_results.is_empty() && ctx.env_state.is_none()
}

impl UserInputMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            user_input_message_context: UserInputMessageContext::default(),
            model_id: None,
            images: Vec::new(),
            origin: Some("KIRO_CLI".to_string()),
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_context(mut self, context: UserInputMessageContext) -> Self {
        self.user_input_message_context = context;
        self
    }

    pub fn with_images(mut self, images: Vec<QImage>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_state: Option<EnvState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl UserInputMessageContext {
    pub fn with_env(os: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            env_state: Some(EnvState {
                operating_system: os.into(),
                current_working_directory: cwd.into(),
            }),
            tools: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvState {
    pub operating_system: String,
    pub current_working_directory: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<ToolUseEntry>>,
}

impl AssistantMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            content: content.into(),
            tool_uses: None,
        }
    }

    pub fn with_tool_uses(mut self, tool_uses: Vec<ToolUseEntry>) -> Self {
        self.tool_uses = if tool_uses.is_empty() {
            None
        } else {
            Some(tool_uses)
        };
        self
    }
}

/// Image attachment in Amazon Q format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QImage {
    /// "jpeg", "png", "gif", "webp"
    pub format: String,
    pub source: QImageSource,
}

impl QImage {
    pub fn from_base64(format: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            source: QImageSource { bytes: data.into() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QImageSource {
    /// Base64 encoded image data
    pub bytes: String,
}

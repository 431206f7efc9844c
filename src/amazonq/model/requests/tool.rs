//! Tool wire types for the Amazon Q request body

use serde::{Deserialize, Serialize};

/// Tool definition sent with the current message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// JSON schema wrapper: `{"json": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

impl InputSchema {
    pub fn from_json(json: serde_json::Value) -> Self {
        Self { json }
    }
}

/// Tool execution result reported back by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ToolResult {
    pub fn new(tool_use_id: impl Into<String>, content: Vec<ToolResultContent>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content,
            status: Some("success".to_string()),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultContent {
    pub text: String,
}

impl ToolResultContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Tool invocation recorded in assistant history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEntry {
    pub tool_use_id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_serializes_camel_case() {
        let tool = Tool {
            tool_specification: ToolSpecification {
                name: "get_weather".into(),
                description: "Weather lookup".into(),
                input_schema: InputSchema::from_json(json!({"type": "object"})),
            },
        };
        let out = serde_json::to_value(&tool).unwrap();
        assert_eq!(out["toolSpecification"]["name"], "get_weather");
        assert_eq!(out["toolSpecification"]["inputSchema"]["json"]["type"], "object");
    }

    #[test]
    fn test_tool_result_shape() {
        let result = ToolResult::new("call_1", vec![ToolResultContent::text("ok")])
            .with_status("error");
        let out = serde_json::to_value(&result).unwrap();
        assert_eq!(out["toolUseId"], "call_1");
        assert_eq!(out["content"][0]["text"], "ok");
        assert_eq!(out["status"], "error");
    }
}

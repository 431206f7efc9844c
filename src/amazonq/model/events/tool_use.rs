//! Tool use events
//!
//! A tool call arrives as a sequence of events sharing one `toolUseId`:
//! the first carries the name, later ones stream input fragments, the last
//! sets `stop`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// String fragment or JSON object, concatenated by the assembler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub stop: bool,
}

impl ToolUseEvent {
    /// Render the input as the text fragment streamed to the caller.
    pub fn input_fragment(&self) -> Option<String> {
        match &self.input {
            None => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(v) => serde_json::to_string(v).ok(),
        }
    }
}

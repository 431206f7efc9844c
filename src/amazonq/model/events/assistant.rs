//! Assistant response events

use serde::{Deserialize, Serialize};

/// First event of every stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialResponseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Assistant text fragment
///
/// Upstream occasionally re-sends cumulative content instead of a delta;
/// the dedup pass in `core::delta` normalizes that before emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseEvent {
    #[serde(default)]
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_event_default_content() {
        let ev: AssistantResponseEvent = serde_json::from_str("{}").unwrap();
        assert_eq!(ev.content, "");
    }

    #[test]
    fn test_initial_response_optional_conversation_id() {
        let ev: InitialResponseEvent = serde_json::from_str("{}").unwrap();
        assert!(ev.conversation_id.is_none());

        let ev: InitialResponseEvent =
            serde_json::from_str(r#"{"conversationId":"abc"}"#).unwrap();
        assert_eq!(ev.conversation_id.as_deref(), Some("abc"));
    }
}

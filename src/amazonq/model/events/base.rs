//! Event base definitions
//!
//! Classifies decoded frames by the `:message-type` / `:event-type` headers
//! into the typed events the stream post-processor consumes.

use crate::amazonq::parser::error::ParseResult;
use crate::amazonq::parser::frame::Frame;

use super::assistant::{AssistantResponseEvent, InitialResponseEvent};
use super::tool_use::ToolUseEvent;

/// Event type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First event of a stream, carries the conversation id
    InitialResponse,
    /// Assistant text fragment
    AssistantResponse,
    /// Tool use open / input fragment / stop
    ToolUse,
    /// End of the assistant turn
    ResponseEnd,
    /// Unknown event type
    Unknown,
}

impl EventType {
    pub fn from_header(s: &str) -> Self {
        match s {
            "initial-response" => Self::InitialResponse,
            "assistantResponseEvent" => Self::AssistantResponse,
            "toolUseEvent" => Self::ToolUse,
            "assistantResponseEnd" => Self::ResponseEnd,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialResponse => "initial-response",
            Self::AssistantResponse => "assistantResponseEvent",
            Self::ToolUse => "toolUseEvent",
            Self::ResponseEnd => "assistantResponseEnd",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified event enum
#[derive(Debug, Clone)]
pub enum Event {
    InitialResponse(InitialResponseEvent),
    AssistantResponse(AssistantResponseEvent),
    ToolUse(ToolUseEvent),
    ResponseEnd,
    /// Unknown event (ignored downstream)
    Unknown,
    /// Server error frame
    Error {
        error_code: String,
        error_message: String,
    },
    /// Server exception frame
    Exception {
        exception_type: String,
        message: String,
    },
}

impl Event {
    /// Classify and parse a decoded frame.
    pub fn from_frame(frame: Frame) -> ParseResult<Self> {
        match frame.message_type().unwrap_or("event") {
            "error" => Ok(Self::Error {
                error_code: frame
                    .headers
                    .error_code()
                    .unwrap_or("UnknownError")
                    .to_string(),
                error_message: frame.payload_as_str(),
            }),
            "exception" => Ok(Self::Exception {
                exception_type: frame
                    .headers
                    .exception_type()
                    .unwrap_or("UnknownException")
                    .to_string(),
                message: frame.payload_as_str(),
            }),
            _ => Self::parse_event(frame),
        }
    }

    fn parse_event(frame: Frame) -> ParseResult<Self> {
        let event_type = EventType::from_header(frame.event_type().unwrap_or("unknown"));
        match event_type {
            EventType::InitialResponse => Ok(Self::InitialResponse(frame.payload_as_json()?)),
            EventType::AssistantResponse => Ok(Self::AssistantResponse(frame.payload_as_json()?)),
            EventType::ToolUse => Ok(Self::ToolUse(frame.payload_as_json()?)),
            EventType::ResponseEnd => Ok(Self::ResponseEnd),
            EventType::Unknown => Ok(Self::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amazonq::parser::frame::{encode_frame, parse_frame};
    use crate::amazonq::parser::header::encode_string_header;

    fn frame_for(event_type: &str, payload: &str) -> Frame {
        let mut headers = encode_string_header(":message-type", "event");
        headers.extend(encode_string_header(":event-type", event_type));
        let bytes = encode_frame(&headers, payload.as_bytes());
        parse_frame(&bytes).unwrap().unwrap().0
    }

    #[test]
    fn test_event_type_from_header() {
        assert_eq!(
            EventType::from_header("assistantResponseEvent"),
            EventType::AssistantResponse
        );
        assert_eq!(EventType::from_header("initial-response"), EventType::InitialResponse);
        assert_eq!(EventType::from_header("somethingElse"), EventType::Unknown);
    }

    #[test]
    fn test_parse_assistant_response() {
        let frame = frame_for("assistantResponseEvent", r#"{"content":"hello"}"#);
        match Event::from_frame(frame).unwrap() {
            Event::AssistantResponse(ev) => assert_eq!(ev.content, "hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_initial_response() {
        let frame = frame_for("initial-response", r#"{"conversationId":"cid-1"}"#);
        match Event::from_frame(frame).unwrap() {
            Event::InitialResponse(ev) => {
                assert_eq!(ev.conversation_id.as_deref(), Some("cid-1"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_exception_frame() {
        let mut headers = encode_string_header(":message-type", "exception");
        headers.extend(encode_string_header(":exception-type", "ThrottlingException"));
        let bytes = encode_frame(&headers, br#"{"reason":"MONTHLY_REQUEST_COUNT"}"#);
        let frame = parse_frame(&bytes).unwrap().unwrap().0;

        match Event::from_frame(frame).unwrap() {
            Event::Exception {
                exception_type,
                message,
            } => {
                assert_eq!(exception_type, "ThrottlingException");
                assert!(message.contains("MONTHLY_REQUEST_COUNT"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

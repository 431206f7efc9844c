//! Upstream error body inspection
//!
//! Amazon Q reports failures either as HTTP error bodies or as error frames
//! inside the event stream. Both carry a JSON body with `message` and
//! `reason` fields; the reason codes decide whether an account is out of
//! quota or suspended before the generic classifier runs.

use serde_json::Value;

/// Structured information about an upstream error
#[derive(Debug, Clone)]
pub struct UpstreamErrorInfo {
    /// Error reason code from the upstream body
    pub reason: String,
    /// User-facing message
    pub user_message: String,
    /// Original message (for logging)
    pub original_message: String,
}

/// Quota exhaustion: monthly request counter tripped.
pub fn is_quota_exhausted_error(error_text: &str) -> bool {
    if error_text.is_empty() {
        return false;
    }
    let lowered = error_text.to_lowercase();
    if lowered.contains("rate limit exceeded") {
        return true;
    }
    if error_text.contains("MONTHLY_REQUEST_COUNT") {
        return true;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(error_text) {
        if obj.get("reason").and_then(|v| v.as_str()) == Some("MONTHLY_REQUEST_COUNT") {
            return true;
        }
        let type_val = obj.get("__type").and_then(|v| v.as_str()).unwrap_or("");
        return type_val.contains("ThrottlingException")
            && obj.get("reason").and_then(|v| v.as_str()) == Some("MONTHLY_REQUEST_COUNT");
    }
    false
}

/// Account suspension: match only explicit suspension markers so ordinary
/// 403/AccessDenied responses are not misread as bans.
pub fn is_account_suspended_error(error_text: &str) -> bool {
    if error_text.is_empty() {
        return false;
    }
    if error_text.contains("TEMPORARILY_SUSPENDED") {
        return true;
    }
    let lowered = error_text.to_lowercase();
    if ["account suspended", "account disabled", "account blocked"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        return true;
    }
    matches!(
        serde_json::from_str::<Value>(error_text),
        Ok(Value::Object(obj)) if obj.get("reason").and_then(|v| v.as_str()) == Some("TEMPORARILY_SUSPENDED")
    )
}

/// Enhance an upstream error JSON with a user-friendly message.
pub fn enhance_upstream_error(error_json: &Value) -> UpstreamErrorInfo {
    let original_message = error_json
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error")
        .to_string();
    let reason = error_json
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("UNKNOWN")
        .to_string();

    let user_message = match reason.as_str() {
        "CONTENT_LENGTH_EXCEEDS_THRESHOLD" => {
            "Model context limit reached. Conversation size exceeds model capacity.".to_string()
        }
        "MONTHLY_REQUEST_LIMIT_REACHED" | "MONTHLY_REQUEST_COUNT" => {
            "Monthly request limit exceeded. Account has reached its monthly quota.".to_string()
        }
        "RATE_LIMIT_EXCEEDED" => {
            "Rate limit exceeded. Please wait a moment before retrying.".to_string()
        }
        "SERVICE_UNAVAILABLE" => {
            "Upstream service temporarily unavailable. Please try again later.".to_string()
        }
        "THROTTLING_EXCEPTION" => "Too many requests. Please slow down and try again.".to_string(),
        "VALIDATION_EXCEPTION" => format!("Invalid request: {}", original_message),
        "UNKNOWN" => original_message.clone(),
        _ => format!("{} (reason: {})", original_message, reason),
    };

    UpstreamErrorInfo {
        reason,
        user_message,
        original_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_monthly_count_is_quota() {
        assert!(is_quota_exhausted_error(
            r#"{"__type":"ThrottlingException","reason":"MONTHLY_REQUEST_COUNT"}"#
        ));
        assert!(is_quota_exhausted_error("Rate limit exceeded for account"));
        assert!(!is_quota_exhausted_error("ThrottlingException: slow down"));
    }

    #[test]
    fn test_suspension_markers() {
        assert!(is_account_suspended_error(r#"{"reason":"TEMPORARILY_SUSPENDED"}"#));
        assert!(is_account_suspended_error("Your account suspended for abuse"));
        assert!(!is_account_suspended_error("AccessDeniedException: no profile"));
    }

    #[test]
    fn test_enhance_known_reason() {
        let info = enhance_upstream_error(&json!({
            "message": "Input is too long.",
            "reason": "CONTENT_LENGTH_EXCEEDS_THRESHOLD"
        }));
        assert!(info.user_message.contains("context limit"));
        assert_eq!(info.original_message, "Input is too long.");
    }

    #[test]
    fn test_enhance_unknown_reason_keeps_original() {
        let info = enhance_upstream_error(&json!({
            "message": "Something went wrong.",
            "reason": "FUTURE_ERROR"
        }));
        assert_eq!(info.user_message, "Something went wrong. (reason: FUTURE_ERROR)");
    }

    #[test]
    fn test_enhance_empty_body() {
        let info = enhance_upstream_error(&json!({}));
        assert_eq!(info.reason, "UNKNOWN");
        assert_eq!(info.user_message, "Unknown error");
    }
}

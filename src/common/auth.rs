//! Common authentication utility functions

use axum::http::HeaderMap;
use axum::http::header;
use subtle::ConstantTimeEq;

/// Extract API Key from request headers
///
/// Supports two authentication methods:
/// - `x-api-key` header
/// - `Authorization: Bearer <token>` header
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Constant-time string comparison to prevent timing attacks
///
/// Uses the security-audited `subtle` crate implementation
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Validate the strict API key format: `sk-` followed by 48 alphanumerics.
pub fn is_valid_api_key_format(key: &str) -> bool {
    let Some(rest) = key.strip_prefix("sk-") else {
        return false;
    };
    rest.len() == 48 && rest.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Best-effort client IP: proxy headers first, then the socket address.
pub fn client_ip(headers: &HeaderMap, remote: Option<&str>) -> String {
    for name in ["cf-connecting-ip", "true-client-ip", "x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            // Multi-value headers carry the real client first
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    remote.unwrap_or("unknown").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-abc"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-abc"));
    }

    #[test]
    fn test_extract_x_api_key_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-first"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-second"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-first"));
    }

    #[test]
    fn test_key_format() {
        let good = format!("sk-{}", "a".repeat(48));
        assert!(is_valid_api_key_format(&good));
        assert!(!is_valid_api_key_format("sk-short"));
        assert!(!is_valid_api_key_format(&format!("pk-{}", "a".repeat(48))));
        assert!(!is_valid_api_key_format(&format!("sk-{}!", "a".repeat(47))));
    }

    #[test]
    fn test_format_validation_is_idempotent() {
        let key = format!("sk-{}", "Z9".repeat(24));
        assert!(is_valid_api_key_format(&key));
        assert!(is_valid_api_key_format(&key));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        assert_eq!(client_ip(&headers, Some("127.0.0.1")), "10.1.2.3");
        assert_eq!(client_ip(&HeaderMap::new(), Some("127.0.0.1")), "127.0.0.1");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "diff"));
    }
}

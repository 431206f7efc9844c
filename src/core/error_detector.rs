//! Account error classification
//!
//! Maps upstream failures (message text, HTTP status, AWS error code) onto a
//! small taxonomy that decides whether to disable the account, mark it
//! throttled, or just retry.

use regex::RegexSet;
use std::sync::OnceLock;

/// Account error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountErrorType {
    /// Permanent suspension / ban
    Suspended,
    /// Temporary rate limit
    RateLimited,
    /// Credential problem (recoverable via refresh)
    AuthError,
    /// Quota exhausted (may recover next month)
    QuotaExceeded,
    /// Transient network failure
    NetworkError,
    /// Conflict
    Conflict,
    Unknown,
}

impl AccountErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::RateLimited => "rate_limited",
            Self::AuthError => "auth_error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::NetworkError => "network_error",
            Self::Conflict => "conflict",
            Self::Unknown => "unknown",
        }
    }
}

/// AWS error codes indicating the account is suspended or unusable
const AWS_SUSPENSION_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedException",
    "ForbiddenException",
    "AccountSuspended",
    "AccountDisabled",
    "ConflictException",
    "ValidationException",
    "InvalidIdentityPoolConfigurationException",
    "NotAuthorizedException",
    "UserNotFoundException",
    "UserPoolTaggingException",
];

/// Amazon Q specific codes that are throttles unless permanent markers appear
const AMAZON_Q_THROTTLE_CODES: &[&str] = &[
    "ThrottlingException",
    "ServiceQuotaExceededException",
    "ResourceLimitExceededException",
    "InternalServerException",
];

fn suspension_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)account\s+.*\s*(suspended|banned|disabled|closed|terminated|deactivated)",
            r"(?i)account[_\s]+(suspended|banned|disabled|closed|terminated|deactivated)",
            r"(?i)access\s+.*\s*(revoked|denied|removed|blocked|restricted)",
            r"(?i)access[_\s]+(revoked|denied|removed|blocked|restricted)",
            r"(?i)subscription\s+.*\s*(expired|cancelled|terminated|suspended)",
            r"(?i)subscription[_\s]+(expired|cancelled|terminated|suspended)",
            r"(?i)service[_\s]+(disabled|suspended)",
            r"(?i)permission[_\s]+(denied|revoked)",
            r"(?i)not[_\s]+authorized",
            r"(?i)unauthorized[_\s]+access",
            r"(?i)invalid[_\s]+credentials",
            r"(?i)authentication[_\s]+failed",
            r"(?i)credentials[_\s]+(expired|invalid|revoked)",
            r"(?i)resource[_\s]+not[_\s]+found",
            r"(?i)organization[_\s]+(deleted|disabled|suspended)",
            r"(?i)workspace[_\s]+(disabled|archived|deleted)",
            r"(?i)project[_\s]+(archived|deleted|suspended)",
            r"(?i)concurrent[_\s]+access[_\s]+violation",
            r"(?i)session[_\s]+(expired|invalid|terminated)",
            r"(?i)token[_\s]+(revoked|invalid)",
            r"(?i)(daily|monthly|annual)[_\s]+quota[_\s]+exceeded",
            r"(?i)(daily|monthly|annual)[_\s]+limit[_\s]+(reached|exceeded)",
            r"(?i)upgrade[_\s]+required",
            r"(?i)billing[_\s]+required",
            r"(?i)payment[_\s]+(required|failed)",
            r"(?i)trial[_\s]+(ended|expired)",
            r"(?i)user[_\s]+not[_\s]+found",
            r"(?i)identity[_\s]+pool[_\s]+configuration",
            r"(?i)invalid[_\s]+identity",
        ])
        .expect("suspension patterns compile")
    })
}

fn rate_limit_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)rate[_\s]+limit[_\s]+(exceeded|reached)",
            r"(?i)too[_\s]+many[_\s]+requests",
            r"(?i)throttl(ed|ing)",
            r"(?i)slow[_\s]+down",
            r"(?i)retry[_\s]+after",
            r"(?i)please[_\s]+wait",
        ])
        .expect("rate limit patterns compile")
    })
}

fn network_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)connection[_\s]+(timeout|refused|reset|aborted)",
            r"(?i)network[_\s]+(error|timeout|unreachable)",
            r"(?i)dns[_\s]+(resolution|lookup)[_\s]+failed",
            r"(?i)ssl[_\s]+(error|handshake[_\s]+failed)",
            r"(?i)socket[_\s]+(timeout|error)",
            r"(?i)service[_\s]+temporarily[_\s]+unavailable",
            r"(?i)timed?[_\s]*out",
        ])
        .expect("network patterns compile")
    })
}

/// Phrases that turn a rate limit into a permanent condition
const PERMANENT_INDICATORS: &[&str] = &[
    "daily quota exceeded",
    "monthly limit reached",
    "monthly quota exceeded",
    "annual limit",
    "upgrade required",
    "billing required",
    "payment required",
    "trial ended",
    "trial expired",
    "subscription expired",
];

const QUOTA_INDICATORS: &[&str] = &[
    "quota exceeded",
    "quota limit",
    "request limit",
    "usage limit",
    "service quota",
];

fn is_permanent_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMANENT_INDICATORS.iter().any(|p| lower.contains(p))
}

fn is_permanent_throttle(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota") || lower.contains("limit exceeded")
}

fn is_quota_exceeded(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_INDICATORS.iter().any(|p| lower.contains(p))
}

/// Classify an error into the account taxonomy.
///
/// Priority: AWS error code, HTTP status, suspension patterns, rate-limit
/// patterns, network patterns, quota phrases, unknown.
pub fn detect_error_type(
    message: &str,
    status_code: Option<u16>,
    error_code: Option<&str>,
) -> (AccountErrorType, String) {
    let error_message = message.to_lowercase();

    if let Some(code) = error_code {
        if AWS_SUSPENSION_CODES.contains(&code) {
            return (
                AccountErrorType::Suspended,
                format!("AWS error code: {}", code),
            );
        }
        if AMAZON_Q_THROTTLE_CODES.contains(&code) {
            if code.to_lowercase().contains("throttling") && is_permanent_throttle(&error_message) {
                return (
                    AccountErrorType::Suspended,
                    format!("Permanent throttling: {}", code),
                );
            }
            return (
                AccountErrorType::RateLimited,
                format!("Amazon Q error: {}", code),
            );
        }
    }

    match status_code {
        Some(401) => return (AccountErrorType::AuthError, "HTTP 401 Unauthorized".into()),
        Some(403) => return (AccountErrorType::Suspended, "HTTP 403 Forbidden".into()),
        Some(429) => {
            if is_permanent_rate_limit(&error_message) {
                return (
                    AccountErrorType::Suspended,
                    "Permanent rate limit exceeded".into(),
                );
            }
            return (AccountErrorType::RateLimited, "Temporary rate limit".into());
        }
        Some(409) => return (AccountErrorType::Conflict, "HTTP 409 Conflict".into()),
        _ => {}
    }

    if suspension_patterns().is_match(&error_message) {
        return (AccountErrorType::Suspended, "Suspension pattern match".into());
    }

    if rate_limit_patterns().is_match(&error_message) {
        if is_permanent_rate_limit(&error_message) {
            return (AccountErrorType::Suspended, "Permanent rate limit".into());
        }
        return (AccountErrorType::RateLimited, "Temporary rate limit".into());
    }

    if network_patterns().is_match(&error_message) {
        return (AccountErrorType::NetworkError, "Network error".into());
    }

    if is_quota_exceeded(&error_message) {
        return (AccountErrorType::QuotaExceeded, "Quota exceeded".into());
    }

    let reason: String = error_message.chars().take(100).collect();
    (AccountErrorType::Unknown, reason)
}

/// Suspended and quota-exhausted accounts are pulled from rotation.
pub fn should_disable_account(error_type: AccountErrorType) -> bool {
    matches!(
        error_type,
        AccountErrorType::Suspended | AccountErrorType::QuotaExceeded
    )
}

pub fn should_mark_rate_limited(error_type: AccountErrorType) -> bool {
    error_type == AccountErrorType::RateLimited
}

/// Suggested retry delay in seconds; `None` means never retry.
pub fn retry_delay_secs(error_type: AccountErrorType) -> Option<u64> {
    match error_type {
        AccountErrorType::RateLimited => Some(60),
        AccountErrorType::NetworkError => Some(5),
        AccountErrorType::Conflict => Some(10),
        AccountErrorType::AuthError => Some(300),
        AccountErrorType::QuotaExceeded => Some(3600),
        AccountErrorType::Suspended => None,
        AccountErrorType::Unknown => Some(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_code_wins() {
        let (t, reason) = detect_error_type("anything", None, Some("AccessDeniedException"));
        assert_eq!(t, AccountErrorType::Suspended);
        assert!(reason.contains("AccessDeniedException"));
    }

    #[test]
    fn test_throttling_code_temporary_vs_permanent() {
        let (t, _) = detect_error_type("rate exceeded", None, Some("ThrottlingException"));
        assert_eq!(t, AccountErrorType::RateLimited);

        let (t, _) = detect_error_type(
            "monthly quota exceeded for subscription",
            None,
            Some("ThrottlingException"),
        );
        assert_eq!(t, AccountErrorType::Suspended);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            detect_error_type("", Some(401), None).0,
            AccountErrorType::AuthError
        );
        assert_eq!(
            detect_error_type("", Some(403), None).0,
            AccountErrorType::Suspended
        );
        assert_eq!(
            detect_error_type("", Some(409), None).0,
            AccountErrorType::Conflict
        );
        assert_eq!(
            detect_error_type("", Some(429), None).0,
            AccountErrorType::RateLimited
        );
        assert_eq!(
            detect_error_type("upgrade required to continue", Some(429), None).0,
            AccountErrorType::Suspended
        );
    }

    #[test]
    fn test_suspension_message_patterns() {
        for msg in [
            "Account suspended due to violation",
            "your subscription expired last week",
            "access revoked by administrator",
            "monthly limit reached, upgrade required",
        ] {
            assert_eq!(
                detect_error_type(msg, None, None).0,
                AccountErrorType::Suspended,
                "{}",
                msg
            );
        }
    }

    #[test]
    fn test_rate_limit_message() {
        assert_eq!(
            detect_error_type("too many requests, slow down", None, None).0,
            AccountErrorType::RateLimited
        );
    }

    #[test]
    fn test_network_errors() {
        for msg in [
            "connection timeout while reading",
            "dns lookup failed for host",
            "service temporarily unavailable",
        ] {
            assert_eq!(
                detect_error_type(msg, None, None).0,
                AccountErrorType::NetworkError,
                "{}",
                msg
            );
        }
    }

    #[test]
    fn test_quota_phrase() {
        assert_eq!(
            detect_error_type("request quota exceeded for this account tier", None, None).0,
            AccountErrorType::QuotaExceeded
        );
    }

    #[test]
    fn test_unknown_truncates_reason() {
        let long = "x".repeat(500);
        let (t, reason) = detect_error_type(&long, None, None);
        assert_eq!(t, AccountErrorType::Unknown);
        assert_eq!(reason.len(), 100);
    }

    #[test]
    fn test_action_table() {
        assert!(should_disable_account(AccountErrorType::Suspended));
        assert!(should_disable_account(AccountErrorType::QuotaExceeded));
        assert!(!should_disable_account(AccountErrorType::RateLimited));
        assert!(should_mark_rate_limited(AccountErrorType::RateLimited));

        assert_eq!(retry_delay_secs(AccountErrorType::Suspended), None);
        assert_eq!(retry_delay_secs(AccountErrorType::QuotaExceeded), Some(3600));
        assert_eq!(retry_delay_secs(AccountErrorType::RateLimited), Some(60));
        assert_eq!(retry_delay_secs(AccountErrorType::AuthError), Some(300));
        assert_eq!(retry_delay_secs(AccountErrorType::NetworkError), Some(5));
        assert_eq!(retry_delay_secs(AccountErrorType::Conflict), Some(10));
        assert_eq!(retry_delay_secs(AccountErrorType::Unknown), Some(30));
    }
}

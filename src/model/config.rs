use std::env;
use std::path::PathBuf;

/// Gateway configuration
///
/// Snapshot of all environment-driven settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Database connection URL; empty selects embedded SQLite
    pub database_url: String,
    /// Per-query timeout in seconds
    pub database_timeout_secs: u64,
    /// Connection cap for the embedded SQLite backend
    pub sqlite_max_connections: u32,

    /// Error count at which an account auto-disables
    pub max_error_count: i64,
    /// Batch-disable accounts that lack refresh credentials
    pub auto_disable_incomplete_accounts: bool,

    /// Upstream Amazon Q endpoint
    pub amazon_q_base_url: String,
    pub amazon_q_path: String,
    pub amazon_q_target: String,
    pub amazon_q_user_agent: String,
    pub amazon_q_x_amz_user_agent: String,
    pub amazon_q_optout: String,
    pub amazon_q_default_model: String,
    pub amazon_q_client_os: String,
    pub amazon_q_client_cwd: String,

    /// Kiro Builder ID token endpoint template, `{region}` substituted
    pub kiro_token_url_template: String,
    pub kiro_default_region: String,

    /// Outbound proxy URL (http:// or https://)
    pub http_proxy: Option<String>,

    /// Reported token counts are scaled by this factor (0 < m <= 10)
    pub token_count_multiplier: f64,
    /// Requests whose input exceeds this are rejected with 400
    pub max_tokens_per_request: usize,
    /// Input size that triggers context compression
    pub token_compress_threshold: usize,

    /// Request dedup window in milliseconds; 0 disables dedup
    pub dedupe_window_ms: u64,
    pub dedupe_max_keys: usize,
    pub dedupe_ignore_model: bool,
    pub request_trace_enabled: bool,

    pub max_auth_sessions: usize,
    pub auth_session_ttl_secs: u64,

    pub lock_dir: PathBuf,
    pub lock_timeout_secs: f64,
    pub lock_stale_timeout_secs: f64,

    /// Strict-mode history validation raises instead of warning
    pub debug_message_conversion: bool,

    /// Strict security level halves rate limits and tightens the
    /// failed-attempt threshold
    pub security_strict: bool,
    /// Default per-key rate limit
    pub rate_limit_per_minute: i64,

    /// Admin API key gating the device-code auth endpoints
    pub admin_api_key: Option<String>,
    pub debug: bool,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

const DEFAULT_AMAZON_Q_BASE_URL: &str = "https://q.us-east-1.amazonaws.com";
const DEFAULT_AMAZON_Q_TARGET: &str =
    "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
const DEFAULT_AMAZON_Q_USER_AGENT: &str =
    "aws-sdk-rust/1.3.2 os/linux lang/rust/1.82.0 api/codewhispererstreaming";
const DEFAULT_KIRO_TOKEN_URL_TEMPLATE: &str = "https://oidc.{region}.amazonaws.com/token";

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let token_count_multiplier: f64 = env_parse("TOKEN_COUNT_MULTIPLIER", 1.0);
        if !(token_count_multiplier > 0.0 && token_count_multiplier <= 10.0) {
            anyhow::bail!(
                "TOKEN_COUNT_MULTIPLIER must be in (0, 10], got {}",
                token_count_multiplier
            );
        }

        let max_error_count: i64 = env_parse("MAX_ERROR_COUNT", 100);
        if max_error_count < 1 {
            anyhow::bail!("MAX_ERROR_COUNT must be >= 1, got {}", max_error_count);
        }

        Ok(Self {
            host: env_str("HOST", "127.0.0.1"),
            port: env_parse("PORT", 8080u16),

            database_url: env_str("DATABASE_URL", ""),
            database_timeout_secs: env_parse("DATABASE_TIMEOUT", 30u64),
            sqlite_max_connections: env_parse("SQLITE_MAX_CONNECTIONS", 10u32),

            max_error_count,
            auto_disable_incomplete_accounts: env_bool("AUTO_DISABLE_INCOMPLETE_ACCOUNTS", false),

            amazon_q_base_url: env_str("AMAZON_Q_BASE_URL", DEFAULT_AMAZON_Q_BASE_URL),
            amazon_q_path: env_str("AMAZON_Q_PATH", "/"),
            amazon_q_target: env_str("AMAZON_Q_TARGET", DEFAULT_AMAZON_Q_TARGET),
            amazon_q_user_agent: env_str("AMAZON_Q_USER_AGENT", DEFAULT_AMAZON_Q_USER_AGENT),
            amazon_q_x_amz_user_agent: env_str(
                "AMAZON_Q_X_AMZ_USER_AGENT",
                DEFAULT_AMAZON_Q_USER_AGENT,
            ),
            amazon_q_optout: env_str("AMAZON_Q_OPTOUT", "true"),
            amazon_q_default_model: env_str("AMAZON_Q_DEFAULT_MODEL", "auto"),
            amazon_q_client_os: env_str("AMAZON_Q_CLIENT_OS", "linux"),
            amazon_q_client_cwd: env_str("AMAZON_Q_CLIENT_CWD", "/workspace"),

            kiro_token_url_template: env_str(
                "KIRO_BUILDER_ID_TOKEN_URL_TEMPLATE",
                DEFAULT_KIRO_TOKEN_URL_TEMPLATE,
            ),
            kiro_default_region: env_str("KIRO_BUILDER_ID_DEFAULT_REGION", "us-east-1"),

            http_proxy: env_opt("HTTP_PROXY")
                .filter(|p| p.starts_with("http://") || p.starts_with("https://")),

            token_count_multiplier,
            max_tokens_per_request: env_parse("MAX_TOKENS_PER_REQUEST", 1_000_000usize),
            token_compress_threshold: env_parse("TOKEN_COMPRESS_THRESHOLD", 950_000usize),

            dedupe_window_ms: env_parse("REQUEST_DEDUPE_WINDOW_MS", 0u64),
            dedupe_max_keys: env_parse("REQUEST_DEDUPE_MAX_KEYS", 2000usize).max(100),
            dedupe_ignore_model: env_bool("REQUEST_DEDUPE_IGNORE_MODEL", false),
            request_trace_enabled: env_bool("REQUEST_TRACE_ENABLED", false),

            max_auth_sessions: env_parse("MAX_AUTH_SESSIONS", 1000usize),
            auth_session_ttl_secs: env_parse("AUTH_SESSION_TTL", 600u64),

            lock_dir: PathBuf::from(env_str("LOCK_DIR", ".locks")),
            lock_timeout_secs: env_parse("LOCK_TIMEOUT", 30.0f64),
            lock_stale_timeout_secs: env_parse("LOCK_STALE_TIMEOUT", 300.0f64),

            debug_message_conversion: env_bool("DEBUG_MESSAGE_CONVERSION", false),

            security_strict: env_str("SECURITY_LEVEL", "production")
                .eq_ignore_ascii_case("military"),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 300i64),

            admin_api_key: env_opt("ADMIN_API_KEY"),
            debug: env_bool("DEBUG", false),
        })
    }

    /// Full upstream chat URL
    pub fn amazon_q_endpoint(&self) -> String {
        format!("{}{}", self.amazon_q_base_url, self.amazon_q_path)
    }

    /// Kiro Builder ID OIDC token URL for a region
    pub fn kiro_token_url(&self, region: Option<&str>) -> String {
        let region = region.unwrap_or(&self.kiro_default_region);
        self.kiro_token_url_template.replace("{region}", region)
    }

    /// Amazon Q full-OAuth OIDC token URL (fixed region)
    pub fn amazonq_token_url(&self) -> String {
        "https://oidc.us-east-1.amazonaws.com/token".to_string()
    }

    pub fn dedupe_enabled(&self) -> bool {
        self.dedupe_window_ms > 0
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            database_url: String::new(),
            database_timeout_secs: 30,
            sqlite_max_connections: 10,
            max_error_count: 100,
            auto_disable_incomplete_accounts: false,
            amazon_q_base_url: DEFAULT_AMAZON_Q_BASE_URL.into(),
            amazon_q_path: "/".into(),
            amazon_q_target: DEFAULT_AMAZON_Q_TARGET.into(),
            amazon_q_user_agent: DEFAULT_AMAZON_Q_USER_AGENT.into(),
            amazon_q_x_amz_user_agent: DEFAULT_AMAZON_Q_USER_AGENT.into(),
            amazon_q_optout: "true".into(),
            amazon_q_default_model: "auto".into(),
            amazon_q_client_os: "linux".into(),
            amazon_q_client_cwd: "/workspace".into(),
            kiro_token_url_template: DEFAULT_KIRO_TOKEN_URL_TEMPLATE.into(),
            kiro_default_region: "us-east-1".into(),
            http_proxy: None,
            token_count_multiplier: 1.0,
            max_tokens_per_request: 1_000_000,
            token_compress_threshold: 950_000,
            dedupe_window_ms: 0,
            dedupe_max_keys: 2000,
            dedupe_ignore_model: false,
            request_trace_enabled: false,
            max_auth_sessions: 1000,
            auth_session_ttl_secs: 600,
            lock_dir: PathBuf::from(".locks"),
            lock_timeout_secs: 30.0,
            lock_stale_timeout_secs: 300.0,
            debug_message_conversion: false,
            security_strict: false,
            rate_limit_per_minute: 300,
            admin_api_key: None,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kiro_token_url_substitutes_region() {
        let config = Config::default();
        assert_eq!(
            config.kiro_token_url(Some("eu-west-1")),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
        assert_eq!(
            config.kiro_token_url(None),
            "https://oidc.us-east-1.amazonaws.com/token"
        );
    }

    #[test]
    fn test_dedupe_disabled_by_default() {
        let config = Config::default();
        assert!(!config.dedupe_enabled());
    }

    #[test]
    fn test_amazon_q_endpoint_joins_path() {
        let mut config = Config::default();
        config.amazon_q_path = "/generateAssistantResponse".into();
        assert_eq!(
            config.amazon_q_endpoint(),
            "https://q.us-east-1.amazonaws.com/generateAssistantResponse"
        );
    }
}

//! HTTP Client builder module
//!
//! Provides unified HTTP Client building with proxy support, plus the
//! process-wide keep-alive pool shared by dispatch and token refresh.

use parking_lot::Mutex;
use reqwest::{Client, Proxy};
use std::time::Duration;

/// Proxy configuration
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Proxy URL, supports http/https/socks5
    pub url: String,
    /// Proxy authentication username
    pub username: Option<String>,
    /// Proxy authentication password
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Create proxy configuration from URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Build HTTP Client
///
/// # Arguments
/// * `proxy` - Optional proxy configuration
/// * `timeout_secs` - Timeout in seconds
pub fn build_client(proxy: Option<&ProxyConfig>, timeout_secs: u64) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .use_rustls_tls();

    if let Some(proxy_config) = proxy {
        let mut proxy = Proxy::all(&proxy_config.url)?;

        if let (Some(username), Some(password)) = (&proxy_config.username, &proxy_config.password) {
            proxy = proxy.basic_auth(username, password);
        }

        builder = builder.proxy(proxy);
        tracing::debug!("HTTP Client using proxy: {}", proxy_config.url);
    }

    Ok(builder.build()?)
}

static SHARED_CLIENT: Mutex<Option<Client>> = Mutex::new(None);

/// Initialize the process-wide keep-alive pool.
///
/// Idempotent under the mutex: an existing pool is dropped before replacement.
/// Pool limits: 100 connections, 60 kept alive per host, 30 s idle.
pub fn init_shared_client(proxy: Option<&ProxyConfig>) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(60)
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .use_rustls_tls();

    if let Some(proxy_config) = proxy {
        let mut p = Proxy::all(&proxy_config.url)?;
        if let (Some(username), Some(password)) = (&proxy_config.username, &proxy_config.password) {
            p = p.basic_auth(username, password);
        }
        builder = builder.proxy(p);
    }

    let client = builder.build()?;
    let mut guard = SHARED_CLIENT.lock();
    if guard.is_some() {
        tracing::info!("Replacing existing shared HTTP client pool");
    }
    *guard = Some(client.clone());
    Ok(client)
}

/// Get the shared pool, building a plain client lazily if init was skipped.
pub fn shared_client() -> Client {
    let mut guard = SHARED_CLIENT.lock();
    if let Some(client) = guard.as_ref() {
        return client.clone();
    }
    let client = Client::builder()
        .pool_max_idle_per_host(60)
        .pool_idle_timeout(Duration::from_secs(30))
        .use_rustls_tls()
        .build()
        .unwrap_or_default();
    *guard = Some(client.clone());
    client
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_config_new() {
        let config = ProxyConfig::new("http://127.0.0.1:7890");
        assert_eq!(config.url, "http://127.0.0.1:7890");
        assert!(config.username.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_proxy_config_with_auth() {
        let config = ProxyConfig::new("socks5://127.0.0.1:1080").with_auth("user", "pass");
        assert_eq!(config.username, Some("user".to_string()));
        assert_eq!(config.password, Some("pass".to_string()));
    }

    #[test]
    fn test_build_client_without_proxy() {
        assert!(build_client(None, 30).is_ok());
    }

    #[test]
    fn test_shared_client_is_idempotent() {
        let first = init_shared_client(None).unwrap();
        let second = shared_client();
        // Both handles point at a live pool; construction never panics
        drop(first);
        drop(second);
    }
}

//! Request dispatch
//!
//! The shared per-request pipeline behind both endpoint families:
//! authenticate, pick an account (pin, session binding, key default, then
//! weighted least-use), dedupe, refresh the token if due, send upstream,
//! and fail over across accounts on retryable errors.

use axum::http::HeaderMap;
use std::sync::Arc;
use thiserror::Error;

use crate::amazonq::client::{EventStream, UpstreamError, send_chat_request};
use crate::amazonq::model::requests::conversation::ChatRequestBody;
use crate::common::auth::{client_ip, extract_api_key, is_valid_api_key_format};
use crate::core::dedupe::{self, RequestDeduper};
use crate::keys::manager::{KeyManager, KeyRecord};
use crate::model::config::Config;
use crate::store::accounts::{Account, AccountStore};
use crate::store::audit::AuditLog;
use crate::store::auth_sessions::AuthSessionStore;
use crate::store::refresher::{RefreshError, TokenRefresher};
use crate::store::sessions::{DEFAULT_SESSION_TTL_SECS, SessionStore};

/// Attempts across accounts before surfacing the failure
const MAX_RETRIES: usize = 3;

/// Process-wide shared state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub accounts: AccountStore,
    pub sessions: SessionStore,
    pub auth_sessions: Arc<AuthSessionStore>,
    pub keys: Arc<KeyManager>,
    pub refresher: TokenRefresher,
    pub deduper: Arc<RequestDeduper>,
    pub audit: AuditLog,
    pub client: reqwest::Client,
}

/// Dispatch failures carry enough to map onto either dialect's error shape
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid or malformed API key")]
    InvalidApiKey,
    #[error("No enabled account available")]
    NoAccounts,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("All candidate accounts are out of quota")]
    QuotaExhaustedAll,
    #[error("All candidate accounts are suspended or unauthorized")]
    AllSuspended,
    #[error("Duplicate request blocked")]
    Duplicate { retry_after_ms: u64 },
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Upstream failure: {0}")]
    Upstream(String),
}

impl DispatchError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidApiKey | Self::NoAccounts => 401,
            Self::Forbidden(_) | Self::AllSuspended => 403,
            Self::BadRequest(_) => 400,
            Self::QuotaExhaustedAll => 402,
            Self::Duplicate { .. } | Self::RateLimited => 429,
            Self::Upstream(_) => 502,
        }
    }

    /// Machine-readable code; dedup and rate-limit 429s stay distinguishable.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::NoAccounts => "no_accounts",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "invalid_request_error",
            Self::QuotaExhaustedAll => "quota_exhausted",
            Self::AllSuspended => "accounts_suspended",
            Self::Duplicate { .. } => "duplicate_request",
            Self::RateLimited => "rate_limit_exceeded",
            Self::Upstream(_) => "upstream_error",
        }
    }
}

/// Weighted least-use: lowest error rate, then fewest successes, then
/// fewest errors.
pub fn select_best_account(candidates: &[Account]) -> Option<&Account> {
    candidates.iter().min_by(|a, b| {
        (a.error_rate(), a.success_count, a.error_count)
            .partial_cmp(&(b.error_rate(), b.success_count, b.error_count))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Resolved request identity
pub struct RequestAuth {
    pub key: KeyRecord,
    pub candidates: Vec<Account>,
    pub client_ip: String,
}

impl AppState {
    /// Authenticate the caller and compute the candidate account set
    /// (enabled accounts intersected with the key's ACL).
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        remote_ip: Option<&str>,
    ) -> Result<RequestAuth, DispatchError> {
        let ip = client_ip(headers, remote_ip);
        let user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let Some(bearer) = extract_api_key(headers) else {
            self.audit
                .record("auth_missing_key", &ip, "no credentials supplied", Some(user_agent))
                .await;
            return Err(DispatchError::InvalidApiKey);
        };
        if !is_valid_api_key_format(&bearer) {
            tracing::warn!("Rejected malformed API key from {}", ip);
            self.audit
                .record("auth_bad_format", &ip, "malformed API key", Some(user_agent))
                .await;
            return Err(DispatchError::InvalidApiKey);
        }

        let Some(key) = self.keys.verify_key(&bearer, Some(&ip), Some(user_agent)).await else {
            self.audit
                .record("auth_failed", &ip, "key verification failed", Some(user_agent))
                .await;
            return Err(DispatchError::InvalidApiKey);
        };

        let all = self
            .accounts
            .list_enabled_accounts()
            .await
            .map_err(|e| DispatchError::Upstream(e.to_string()))?;
        if all.is_empty() {
            return Err(DispatchError::NoAccounts);
        }

        let candidates = if key.allowed_account_ids.is_empty() {
            all
        } else {
            let scoped: Vec<Account> = all
                .into_iter()
                .filter(|account| key.allowed_account_ids.contains(&account.id))
                .collect();
            if scoped.is_empty() {
                return Err(DispatchError::Forbidden(
                    "API key has no permitted accounts".into(),
                ));
            }
            scoped
        };

        Ok(RequestAuth {
            key,
            candidates,
            client_ip: ip,
        })
    }

    /// Pick the account for this request: explicit pin, session binding,
    /// key default, then weighted least-use.
    pub async fn select_account(
        &self,
        auth: &RequestAuth,
        headers: &HeaderMap,
        session_key: Option<&str>,
    ) -> Result<Account, DispatchError> {
        if let Some(requested) = headers.get("x-account-id").and_then(|v| v.to_str().ok()) {
            let requested = requested.trim();
            if uuid::Uuid::parse_str(requested).is_err() {
                return Err(DispatchError::BadRequest("Invalid account ID format".into()));
            }
            return auth
                .candidates
                .iter()
                .find(|account| account.id == requested)
                .cloned()
                .ok_or_else(|| {
                    DispatchError::Forbidden("Account not allowed for this key".into())
                });
        }

        if let Some(session_key) = session_key {
            if let Ok(Some(bound)) = self.sessions.get_session_account(session_key).await {
                if let Some(account) =
                    auth.candidates.iter().find(|account| account.id == bound)
                {
                    tracing::debug!("Session {} sticks to account {}", session_key, bound);
                    return Ok(account.clone());
                }
            }
        }

        if let Some(default) = &auth.key.default_account_id {
            if let Some(account) = auth.candidates.iter().find(|a| &a.id == default) {
                return Ok(account.clone());
            }
        }

        select_best_account(&auth.candidates)
            .cloned()
            .ok_or(DispatchError::NoAccounts)
    }

    /// Request-dedup gate. `Err(Duplicate)` inside the window.
    pub fn check_dedupe(
        &self,
        headers: &HeaderMap,
        path: &str,
        model: &str,
        body: &serde_json::Value,
        remote_ip: &str,
    ) -> Result<(), DispatchError> {
        if !self.deduper.enabled() || dedupe::bypass_requested(headers) {
            return Ok(());
        }

        let (key_model, fingerprint) = if self.config.dedupe_ignore_model {
            ("*".to_string(), dedupe::fingerprint_drop(body, &["model"]))
        } else {
            (model.to_string(), dedupe::fingerprint(body))
        };

        if self.config.request_trace_enabled {
            tracing::info!(
                "trace path={} model={} ip={} fp={}",
                path,
                model,
                remote_ip,
                &fingerprint[..12]
            );
        }

        let client = dedupe::client_id(headers, remote_ip);
        let key = dedupe::make_key(&client, path, &key_model, &fingerprint);
        if let Some(retry_after_ms) = self.deduper.check_and_mark(&key) {
            tracing::warn!(
                "Duplicate blocked: path={} model={} fp={} retry_after_ms={}",
                path,
                model,
                &fingerprint[..12],
                retry_after_ms
            );
            return Err(DispatchError::Duplicate { retry_after_ms });
        }
        Ok(())
    }

    /// Refresh the account's token when absent or expired.
    pub async fn ensure_fresh_account(&self, account: Account) -> Result<Account, DispatchError> {
        if !account.is_access_token_expired(0) {
            return Ok(account);
        }
        match self.refresher.refresh_access_token(&account.id).await {
            Ok(refreshed) => {
                if refreshed.access_token.is_none() {
                    return Err(DispatchError::Upstream(
                        "Access token unavailable after refresh".into(),
                    ));
                }
                Ok(refreshed)
            }
            Err(RefreshError::LockTimeout(e)) => {
                Err(DispatchError::Upstream(format!("Refresh lock timeout: {}", e)))
            }
            Err(e) => Err(DispatchError::Upstream(e.to_string())),
        }
    }

    /// Send upstream with account fail-over.
    ///
    /// Retryable failures (quota, suspension, auth, rate limit, network)
    /// consume one attempt, mark the failing account, and move to the next
    /// candidate. Exhaustion surfaces the dominant failure class.
    pub async fn send_with_failover(
        &self,
        auth: &RequestAuth,
        mut account: Account,
        body: &ChatRequestBody,
        conversation_id: &str,
    ) -> Result<(Account, EventStream), DispatchError> {
        let mut tried: Vec<String> = vec![account.id.clone()];
        let mut saw_quota = false;
        let mut saw_suspension = false;
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..MAX_RETRIES {
            let fresh = match self.ensure_fresh_account(account.clone()).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    // A refresh failure burns this account for the request
                    tracing::warn!("Refresh failed for {} on attempt {}: {}", account.id, attempt, e);
                    match self.next_candidate(auth, &tried).await {
                        Some(next) => {
                            tried.push(next.id.clone());
                            account = next;
                            continue;
                        }
                        None => return Err(e),
                    }
                }
            };
            account = fresh;
            let access = account
                .access_token
                .clone()
                .ok_or_else(|| DispatchError::Upstream("Account has no access token".into()))?;

            match send_chat_request(
                &self.client,
                &self.config,
                &access,
                body,
                Some(conversation_id.to_string()),
            )
            .await
            {
                Ok(stream) => return Ok((account, stream)),
                Err(e) => {
                    tracing::warn!(
                        "Upstream send failed for account {} (attempt {}): {}",
                        account.id,
                        attempt + 1,
                        e
                    );
                    match &e {
                        UpstreamError::QuotaExhausted(_) => {
                            saw_quota = true;
                            let _ = self
                                .accounts
                                .update_account_stats(&account.id, false, true, true)
                                .await;
                        }
                        UpstreamError::Suspended(_) => {
                            saw_suspension = true;
                            let _ = self.accounts.disable_account(&account.id, "suspended").await;
                        }
                        UpstreamError::Unauthorized(_) => {
                            saw_suspension = true;
                            let _ = self
                                .accounts
                                .disable_account(&account.id, "unauthorized")
                                .await;
                        }
                        UpstreamError::Http { status, body } => {
                            self.accounts
                                .handle_account_error(&account.id, body, Some(*status), None)
                                .await;
                            // Client-side errors are not account failures
                            if (400..500).contains(status) && *status != 429 {
                                return Err(DispatchError::Upstream(format!(
                                    "HTTP {}: {}",
                                    status, body
                                )));
                            }
                        }
                        UpstreamError::Network(_) => {
                            // Transient; the account keeps its stats
                        }
                    }
                    last_error = Some(e);

                    match self.next_candidate(auth, &tried).await {
                        Some(next) => {
                            tried.push(next.id.clone());
                            account = next;
                        }
                        None => break,
                    }
                }
            }
        }

        if saw_quota && !saw_suspension {
            return Err(DispatchError::QuotaExhaustedAll);
        }
        if saw_suspension {
            return Err(DispatchError::AllSuspended);
        }
        Err(DispatchError::Upstream(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "No event stream returned".into()),
        ))
    }

    /// Best remaining candidate after removing already-tried accounts.
    async fn next_candidate(&self, auth: &RequestAuth, tried: &[String]) -> Option<Account> {
        // Re-list so accounts disabled mid-request drop out
        let current = self.accounts.list_enabled_accounts().await.ok()?;
        let allowed: Vec<Account> = current
            .into_iter()
            .filter(|account| {
                !tried.contains(&account.id)
                    && (auth.key.allowed_account_ids.is_empty()
                        || auth.key.allowed_account_ids.contains(&account.id))
            })
            .collect();
        select_best_account(&allowed).cloned()
    }

    /// Guard for a streaming response; see [`UsageGuard`].
    pub fn usage_guard(&self, account_id: &str, session_key: &str) -> UsageGuard {
        UsageGuard {
            state: self.clone(),
            account_id: account_id.to_string(),
            session_key: session_key.to_string(),
            emitted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            completed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Terminal bookkeeping for a served request.
    pub async fn record_success(&self, account_id: &str, session_key: Option<&str>) {
        if let Err(e) = self
            .accounts
            .update_account_stats(account_id, true, false, false)
            .await
        {
            tracing::warn!("Failed to record success for {}: {}", account_id, e);
        }
        if let Some(session_key) = session_key {
            if let Err(e) = self
                .sessions
                .bind_session_account(session_key, account_id, DEFAULT_SESSION_TTL_SECS)
                .await
            {
                tracing::warn!("Failed to bind session {}: {}", session_key, e);
            }
        }
    }
}

/// Client-disconnect accounting for streaming responses.
///
/// The generator marks bytes as they go out and flags completion at the
/// end; if the stream is dropped early (generator exit), the guard records
/// partial success when bytes already reached the client, failure stats
/// otherwise.
pub struct UsageGuard {
    state: AppState,
    account_id: String,
    session_key: String,
    emitted: Arc<std::sync::atomic::AtomicBool>,
    completed: Arc<std::sync::atomic::AtomicBool>,
}

impl UsageGuard {
    pub fn mark_emitted(&self) {
        self.emitted.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        use std::sync::atomic::Ordering;
        if self.completed.load(Ordering::SeqCst) {
            return;
        }
        let emitted = self.emitted.load(Ordering::SeqCst);
        let state = self.state.clone();
        let account_id = self.account_id.clone();
        let session_key = self.session_key.clone();
        tokio::spawn(async move {
            if emitted {
                tracing::warn!(
                    "Client disconnected mid-stream from account {}; recording partial success",
                    account_id
                );
                state.record_success(&account_id, Some(&session_key)).await;
            } else if let Err(e) = state
                .accounts
                .update_account_stats(&account_id, false, false, false)
                .await
            {
                tracing::warn!("Failed to record disconnect stats: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, errors: i64, successes: i64) -> Account {
        Account {
            id: id.into(),
            label: None,
            client_id: Some("c".into()),
            client_secret: Some("s".into()),
            refresh_token: Some("r".into()),
            access_token: Some("t".into()),
            expires_at: None,
            other: serde_json::json!({}),
            last_refresh_time: None,
            last_refresh_status: None,
            created_at: None,
            updated_at: None,
            enabled: true,
            error_count: errors,
            success_count: successes,
            quota_exhausted: false,
        }
    }

    #[test]
    fn test_select_best_prefers_low_error_rate() {
        let candidates = vec![account("bad", 5, 5), account("good", 0, 100), account("fresh", 0, 2)];
        // error rates: bad 0.5, good 0.0, fresh 0.0; ties break on fewer successes
        assert_eq!(select_best_account(&candidates).unwrap().id, "fresh");
    }

    #[test]
    fn test_select_best_tie_breaks_on_error_count() {
        let mut a = account("a", 0, 10);
        a.error_count = 0;
        let mut b = account("b", 0, 10);
        b.error_count = 0;
        // Fully tied: first wins deterministically
        assert_eq!(select_best_account(&[a, b]).unwrap().id, "a");
    }

    #[test]
    fn test_select_best_empty() {
        assert!(select_best_account(&[]).is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(DispatchError::InvalidApiKey.status_code(), 401);
        assert_eq!(DispatchError::QuotaExhaustedAll.status_code(), 402);
        assert_eq!(DispatchError::AllSuspended.status_code(), 403);
        assert_eq!(DispatchError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(
            DispatchError::Duplicate { retry_after_ms: 5 }.status_code(),
            429
        );
        assert_eq!(DispatchError::RateLimited.status_code(), 429);
        assert_eq!(DispatchError::Upstream("x".into()).status_code(), 502);

        // The two 429 classes stay distinguishable by code
        assert_ne!(
            DispatchError::Duplicate { retry_after_ms: 5 }.code(),
            DispatchError::RateLimited.code()
        );
    }
}

//! OAuth token refresh
//!
//! `refresh_access_token` is the single path that mutates account tokens.
//! A cross-process advisory lock serializes refreshes per account; inside
//! the lock the row is re-read and the refresh is skipped when another
//! worker already did the work.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::accounts::{Account, AccountError, AccountStore, calc_expires_at, parse_utc_iso_ts};
use super::db::now_iso;
use crate::core::lock::{DistributedLockManager, LockError};
use crate::model::config::Config;

/// Re-reads inside this window return the fresh row instead of refreshing
const REFRESH_DEBOUNCE_SECS: i64 = 60;

/// Scheduled refresh: tokens last refreshed longer ago than this with no
/// known expiry are refreshed proactively
const STALE_REFRESH_SECS: i64 = 25 * 60;

/// Scheduled refresh loop period
const REFRESH_LOOP_SECS: u64 = 5 * 60;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("token refresh lock timeout: {0}")]
    LockTimeout(#[from] LockError),
    #[error("account missing credentials for refresh: {0}")]
    MissingCredentials(String),
    #[error("token refresh failed: {0}")]
    Upstream(String),
    #[error(transparent)]
    Account(#[from] AccountError),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcRefreshRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OidcRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// x-amz-user-agent sent on Amazon Q full-OAuth refreshes
const AMZ_SDK_USER_AGENT: &str =
    "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser api/sso-oidc#3.738.0";
const AWS_CLI_USER_AGENT: &str =
    "aws-cli/2.15.30 Python/3.11.8 Linux/6.5.0 exe/x86_64.ubuntu.22 prompt/off command/sso-oidc.create-token";

#[derive(Clone)]
pub struct TokenRefresher {
    store: AccountStore,
    config: Arc<Config>,
    locks: DistributedLockManager,
    client: reqwest::Client,
}

impl TokenRefresher {
    pub fn new(
        store: AccountStore,
        config: Arc<Config>,
        locks: DistributedLockManager,
        client: reqwest::Client,
    ) -> Self {
        Self {
            store,
            config,
            locks,
            client,
        }
    }

    /// Refresh an account's access token under the per-account lock.
    ///
    /// Inside the lock:
    /// 1. the row is re-read;
    /// 2. a known, future expiry skips the refresh entirely;
    /// 3. a refresh within the last 60 s returns the fresh row (another
    ///    worker raced us);
    /// 4. otherwise the provider-specific OIDC refresh runs and the token
    ///    columns are written in one UPDATE.
    pub async fn refresh_access_token(&self, account_id: &str) -> Result<Account, RefreshError> {
        let resource = format!("token_refresh_{}", account_id);
        let _guard = self.locks.acquire(&resource).await?;

        let account = self.store.get_account(account_id).await?;

        if account.effective_expires_at().is_some() && !account.is_access_token_expired(0) {
            return Ok(account);
        }

        if let Some(last_refresh) = account
            .last_refresh_time
            .as_deref()
            .and_then(parse_utc_iso_ts)
        {
            if chrono::Utc::now().timestamp() - last_refresh < REFRESH_DEBOUNCE_SECS {
                tracing::debug!(
                    "Account {} refreshed moments ago, returning fresh row",
                    account_id
                );
                return Ok(self.store.get_account(account_id).await?);
            }
        }

        if account.is_kiro() {
            self.refresh_kiro(&account).await
        } else {
            self.refresh_amazonq(&account).await
        }
    }

    async fn refresh_kiro(&self, account: &Account) -> Result<Account, RefreshError> {
        let refresh_token = account.refresh_token.as_deref().ok_or_else(|| {
            RefreshError::MissingCredentials("Kiro account missing refreshToken".into())
        })?;
        let (client_id, client_secret) = match (
            account.client_id.as_deref(),
            account.client_secret.as_deref(),
        ) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(RefreshError::MissingCredentials(
                    "Kiro account missing clientId/clientSecret for Builder ID refresh".into(),
                ));
            }
        };

        tracing::info!("Refreshing Kiro Builder ID token for account {}", account.id);
        let url = self.config.kiro_token_url(account.region());
        let body = OidcRefreshRequest {
            grant_type: "refresh_token",
            client_id,
            client_secret,
            refresh_token,
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "KiroIDE")
            .header("x-amz-user-agent", AMZ_SDK_USER_AGENT)
            .json(&body)
            .send()
            .await;

        self.finish_refresh(account, response).await
    }

    async fn refresh_amazonq(&self, account: &Account) -> Result<Account, RefreshError> {
        let (client_id, client_secret, refresh_token) = match (
            account.client_id.as_deref(),
            account.client_secret.as_deref(),
            account.refresh_token.as_deref(),
        ) {
            (Some(id), Some(secret), Some(token)) => (id, secret, token),
            _ => {
                return Err(RefreshError::MissingCredentials(
                    "Account missing clientId/clientSecret/refreshToken for refresh".into(),
                ));
            }
        };

        tracing::info!("Refreshing Amazon Q token for account {}", account.id);
        let body = OidcRefreshRequest {
            grant_type: "refresh_token",
            client_id,
            client_secret,
            refresh_token,
        };

        let response = self
            .client
            .post(self.config.amazonq_token_url())
            .header("Content-Type", "application/json")
            .header("User-Agent", AWS_CLI_USER_AGENT)
            .header("x-amz-user-agent", AMZ_SDK_USER_AGENT)
            .json(&body)
            .send()
            .await;

        self.finish_refresh(account, response).await
    }

    /// Shared tail: record failure status or write the refreshed tokens.
    async fn finish_refresh(
        &self,
        account: &Account,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<Account, RefreshError> {
        let data: OidcRefreshResponse = match response {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(data) => data,
                Err(e) => {
                    self.record_refresh_failure(&account.id).await;
                    return Err(RefreshError::Upstream(format!("invalid OIDC response: {}", e)));
                }
            },
            Ok(resp) => {
                let status = resp.status();
                self.record_refresh_failure(&account.id).await;
                // Status only; bodies can echo token material
                tracing::error!("Token refresh failed for {}: HTTP {}", account.id, status);
                return Err(RefreshError::Upstream(format!("HTTP {}", status)));
            }
            Err(e) => {
                self.record_refresh_failure(&account.id).await;
                tracing::error!(
                    "Token refresh transport error for {}: {}",
                    account.id,
                    e.without_url()
                );
                return Err(RefreshError::Upstream("network error".into()));
            }
        };

        let new_refresh = data
            .refresh_token
            .as_deref()
            .or(account.refresh_token.as_deref());
        let expires_at = calc_expires_at(data.expires_in);
        let now = now_iso();

        let db = self.store.db();
        let sql = db.sql(
            "UPDATE accounts
             SET accessToken=?, refreshToken=?, expires_at=?, last_refresh_time=?,
                 last_refresh_status=?, updated_at=?
             WHERE id=?",
        );
        db.timed(
            sqlx::query(&sql)
                .bind(&data.access_token)
                .bind(new_refresh)
                .bind(&expires_at)
                .bind(&now)
                .bind("success")
                .bind(&now)
                .bind(&account.id)
                .execute(db.pool()),
        )
        .await
        .map_err(AccountError::Db)?;

        Ok(self.store.get_account(&account.id).await?)
    }

    async fn record_refresh_failure(&self, account_id: &str) {
        let now = now_iso();
        let db = self.store.db();
        let sql = db.sql(
            "UPDATE accounts SET last_refresh_time=?, last_refresh_status=?, updated_at=? WHERE id=?",
        );
        if let Err(e) = db
            .timed(
                sqlx::query(&sql)
                    .bind(&now)
                    .bind("failed")
                    .bind(&now)
                    .bind(account_id)
                    .execute(db.pool()),
            )
            .await
        {
            tracing::error!("Failed to record refresh failure for {}: {}", account_id, e);
        }
        if let Err(e) = self
            .store
            .update_account_stats(account_id, false, false, false)
            .await
        {
            tracing::error!("Failed to update stats after refresh failure: {}", e);
        }
    }

    fn needs_scheduled_refresh(account: &Account) -> bool {
        if account.access_token.is_none() {
            return true;
        }
        if account.effective_expires_at().is_some() {
            return account.is_access_token_expired(0);
        }
        // No known expiry: refresh when the last refresh is stale
        match account
            .last_refresh_time
            .as_deref()
            .and_then(parse_utc_iso_ts)
        {
            Some(last) => chrono::Utc::now().timestamp() - last > STALE_REFRESH_SECS,
            None => true,
        }
    }

    /// Background loop: wake every five minutes and refresh stale tokens.
    /// Individual failures are logged and never stop the loop.
    pub async fn run_scheduled_refresh_loop(self) {
        loop {
            tokio::time::sleep(Duration::from_secs(REFRESH_LOOP_SECS)).await;

            let accounts = match self.store.list_enabled_accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    tracing::error!("Scheduled refresh: account listing failed: {}", e);
                    continue;
                }
            };

            for account in accounts {
                if !Self::needs_scheduled_refresh(&account) {
                    continue;
                }
                match self.refresh_access_token(&account.id).await {
                    Ok(_) => tracing::info!("Scheduled refresh succeeded for {}", account.id),
                    Err(RefreshError::MissingCredentials(reason)) => {
                        tracing::warn!(
                            "Scheduled refresh: account {} missing credentials: {}",
                            account.id,
                            reason
                        );
                        if let Err(e) = self
                            .store
                            .disable_account(&account.id, "missing_credentials")
                            .await
                        {
                            tracing::error!("Failed to disable {}: {}", account.id, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Scheduled refresh failed for {}: {}", account.id, e)
                    }
                }
            }

            self.locks.cleanup_stale_locks();
        }
    }
}

//! Account pool store
//!
//! CRUD and bookkeeping over the upstream accounts. Stats mutations are
//! single atomic UPDATE statements so concurrent requests never race a
//! read-modify-write cycle.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::Row;
use sqlx::any::AnyRow;
use thiserror::Error;

use super::db::{Database, DbError, now_iso};
use super::quota::QuotaTracker;
use crate::core::error_detector::{
    AccountErrorType, detect_error_type, should_disable_account, should_mark_rate_limited,
};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found")]
    NotFound,
    #[error("duplicate account: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

pub type AccountResult<T> = Result<T, AccountError>;

/// Account row
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub label: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<String>,
    pub other: Value,
    pub last_refresh_time: Option<String>,
    pub last_refresh_status: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub enabled: bool,
    pub error_count: i64,
    pub success_count: i64,
    pub quota_exhausted: bool,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

fn parse_other(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .filter(|v| v.is_object())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

/// Parse the row timestamp format to epoch seconds.
pub fn parse_utc_iso_ts(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Absolute expiry timestamp for a token lifetime.
pub fn calc_expires_at(expires_in: Option<i64>) -> Option<String> {
    let seconds = expires_in?;
    if seconds <= 0 {
        return None;
    }
    Some(
        (Utc::now() + chrono::Duration::seconds(seconds))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
    )
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    email: Option<String>,
    preferred_username: Option<String>,
    sub: Option<String>,
}

/// Extract an email from a JWT access token payload.
///
/// Priority: email claim, then preferred_username / sub when they look like
/// addresses.
pub fn extract_email_from_jwt(access_token: &str) -> Option<String> {
    let parts: Vec<&str> = access_token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(parts[1]).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&decoded).ok()?;

    if let Some(email) = claims.email {
        if !email.is_empty() {
            return Some(email);
        }
    }
    if let Some(username) = claims.preferred_username {
        if username.contains('@') {
            return Some(username);
        }
    }
    if let Some(sub) = claims.sub {
        if sub.contains('@') {
            return Some(sub);
        }
    }
    None
}

fn refresh_token_hash(refresh_token: &str) -> String {
    hex::encode(Sha256::digest(refresh_token.as_bytes()))
}

impl Account {
    pub fn from_row(row: &AnyRow) -> Self {
        Self {
            id: row.try_get("id").unwrap_or_default(),
            label: row.try_get("label").ok(),
            client_id: row.try_get("clientId").ok(),
            client_secret: row.try_get("clientSecret").ok(),
            refresh_token: row.try_get("refreshToken").ok(),
            access_token: row.try_get("accessToken").ok(),
            expires_at: row.try_get("expires_at").ok(),
            other: parse_other(row.try_get("other").ok()),
            last_refresh_time: row.try_get("last_refresh_time").ok(),
            last_refresh_status: row.try_get("last_refresh_status").ok(),
            created_at: row.try_get("created_at").ok(),
            updated_at: row.try_get("updated_at").ok(),
            enabled: row.try_get::<i64, _>("enabled").unwrap_or(0) != 0,
            error_count: row.try_get("error_count").unwrap_or(0),
            success_count: row.try_get("success_count").unwrap_or(0),
            quota_exhausted: row.try_get::<i64, _>("quota_exhausted").unwrap_or(0) != 0,
        }
    }

    fn other_str(&self, key: &str) -> Option<&str> {
        self.other.get(key).and_then(|v| v.as_str())
    }

    pub fn is_kiro(&self) -> bool {
        self.other_str("provider")
            .map(|p| p.trim().eq_ignore_ascii_case("kiro"))
            .unwrap_or(false)
    }

    pub fn region(&self) -> Option<&str> {
        self.other_str("idcRegion").or_else(|| self.other_str("region"))
    }

    /// Expiry from the dedicated column, falling back to `other.expiresAt`.
    pub fn effective_expires_at(&self) -> Option<&str> {
        self.expires_at
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.other_str("expiresAt")
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
    }

    /// Missing access token or unknown/elapsed expiry means a refresh is due.
    pub fn is_access_token_expired(&self, leeway_secs: i64) -> bool {
        if !present(&self.access_token) {
            return true;
        }
        let Some(expires_at) = self.effective_expires_at() else {
            return true;
        };
        match parse_utc_iso_ts(expires_at) {
            Some(exp) => Utc::now().timestamp() >= exp - leeway_secs.max(0),
            None => true,
        }
    }

    fn has_full_credentials(&self) -> bool {
        present(&self.client_id) && present(&self.client_secret) && present(&self.refresh_token)
    }

    /// Kiro accounts refresh with the token alone; full-OAuth accounts need
    /// the client pair too.
    pub fn has_refresh_credentials(&self) -> bool {
        if self.is_kiro() {
            present(&self.refresh_token)
        } else {
            self.has_full_credentials()
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.error_count + self.success_count;
        if total > 0 {
            self.error_count as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AccountUpdate {
    pub label: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub other: Option<Value>,
    pub enabled: Option<bool>,
}

#[derive(Clone)]
pub struct AccountStore {
    db: Database,
    quota: QuotaTracker,
    max_error_count: i64,
    auto_disable_incomplete: bool,
}

impl AccountStore {
    pub fn new(db: Database, max_error_count: i64, auto_disable_incomplete: bool) -> Self {
        Self {
            quota: QuotaTracker::new(db.clone()),
            db,
            max_error_count,
            auto_disable_incomplete,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn get_account(&self, account_id: &str) -> AccountResult<Account> {
        let sql = self.db.sql("SELECT * FROM accounts WHERE id=?");
        let row = self
            .db
            .timed(sqlx::query(&sql).bind(account_id).fetch_optional(self.db.pool()))
            .await?;
        row.map(|r| Account::from_row(&r)).ok_or(AccountError::NotFound)
    }

    /// Enabled accounts with usable refresh credentials.
    ///
    /// Rows lacking credentials are skipped; with auto-disable on they are
    /// also disabled in chunks of individual parameterized UPDATEs.
    pub async fn list_enabled_accounts(&self) -> AccountResult<Vec<Account>> {
        let sql = self
            .db
            .sql("SELECT * FROM accounts WHERE enabled=1 ORDER BY created_at DESC");
        let rows = self.db.timed(sqlx::query(&sql).fetch_all(self.db.pool())).await?;

        let mut valid = Vec::new();
        let mut invalid_ids = Vec::new();
        for row in &rows {
            let account = Account::from_row(row);
            if account.has_refresh_credentials() {
                valid.push(account);
            } else {
                tracing::warn!(
                    "Skipping enabled account {} with incomplete credentials",
                    account.id
                );
                invalid_ids.push(account.id);
            }
        }

        if !invalid_ids.is_empty() && self.auto_disable_incomplete {
            self.batch_disable(&invalid_ids, "missing_credentials").await;
        }

        Ok(valid)
    }

    /// Disable ids in chunks of 20, one parameterized UPDATE per row (never
    /// a string-built IN clause).
    async fn batch_disable(&self, ids: &[String], reason: &str) {
        const MAX_BATCH: usize = 100;
        const CHUNK: usize = 20;

        let ids = &ids[..ids.len().min(MAX_BATCH)];
        let now = now_iso();
        let sql = self
            .db
            .sql("UPDATE accounts SET enabled=0, last_refresh_status=?, updated_at=? WHERE id=?");

        let mut disabled = 0usize;
        for chunk in ids.chunks(CHUNK) {
            for id in chunk {
                if uuid::Uuid::parse_str(id).is_err() {
                    tracing::warn!("Skipping malformed account id in batch disable: {}", id);
                    continue;
                }
                match self
                    .db
                    .timed(
                        sqlx::query(&sql)
                            .bind(reason)
                            .bind(&now)
                            .bind(id)
                            .execute(self.db.pool()),
                    )
                    .await
                {
                    Ok(_) => disabled += 1,
                    Err(e) => tracing::error!("Failed to disable account {}: {}", id, e),
                }
            }
        }
        if disabled > 0 {
            tracing::info!("Batch-disabled {} incomplete accounts", disabled);
        }
    }

    pub async fn list_disabled_accounts(&self) -> AccountResult<Vec<Account>> {
        let sql = self
            .db
            .sql("SELECT * FROM accounts WHERE enabled=0 ORDER BY created_at DESC");
        let rows = self.db.timed(sqlx::query(&sql).fetch_all(self.db.pool())).await?;
        Ok(rows.iter().map(Account::from_row).collect())
    }

    pub async fn count_enabled_accounts(&self) -> AccountResult<i64> {
        let sql = self.db.sql("SELECT COUNT(*) AS n FROM accounts WHERE enabled=1");
        let row = self.db.timed(sqlx::query(&sql).fetch_one(self.db.pool())).await?;
        Ok(row.try_get("n").unwrap_or(0))
    }

    /// Reject creation when another account holds the same refresh token or
    /// the same email identity.
    async fn check_duplicate(
        &self,
        refresh_token: Option<&str>,
        email: Option<&str>,
    ) -> AccountResult<()> {
        let token_hash = refresh_token.map(refresh_token_hash);
        if token_hash.is_none() && email.is_none() {
            return Ok(());
        }

        let sql = self.db.sql("SELECT id, refreshToken, other FROM accounts");
        let rows = self.db.timed(sqlx::query(&sql).fetch_all(self.db.pool())).await?;
        for row in rows {
            let existing_token: Option<String> = row.try_get("refreshToken").ok();
            if let (Some(hash), Some(existing)) = (&token_hash, existing_token.as_deref()) {
                if !existing.is_empty() && refresh_token_hash(existing) == *hash {
                    let id: String = row.try_get("id").unwrap_or_default();
                    return Err(AccountError::Duplicate(format!(
                        "refresh token already registered to account {}",
                        id
                    )));
                }
            }
            if let Some(email) = email {
                let other = parse_other(row.try_get("other").ok());
                if other.get("email").and_then(|v| v.as_str()) == Some(email) {
                    let id: String = row.try_get("id").unwrap_or_default();
                    return Err(AccountError::Duplicate(format!(
                        "email {} already registered to account {}",
                        email, id
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn create_account_from_tokens(
        &self,
        client_id: &str,
        client_secret: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        label: Option<&str>,
        enabled: bool,
        expires_in: Option<i64>,
    ) -> AccountResult<Account> {
        self.create_account_inner(
            client_id,
            client_secret,
            access_token,
            refresh_token,
            label,
            enabled,
            expires_in,
            serde_json::json!({"provider": "amazonq"}),
        )
        .await
    }

    pub async fn create_kiro_builder_id_account_from_tokens(
        &self,
        client_id: &str,
        client_secret: &str,
        access_token: &str,
        refresh_token: &str,
        label: Option<&str>,
        enabled: bool,
        region: Option<&str>,
        expires_in: Option<i64>,
    ) -> AccountResult<Account> {
        let mut other = serde_json::json!({
            "provider": "kiro",
            "authMethod": "builder-id",
        });
        if let Some(region) = region {
            other["idcRegion"] = Value::String(region.to_string());
        }
        self.create_account_inner(
            client_id,
            client_secret,
            access_token,
            Some(refresh_token),
            label,
            enabled,
            expires_in,
            other,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_account_inner(
        &self,
        client_id: &str,
        client_secret: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        label: Option<&str>,
        enabled: bool,
        expires_in: Option<i64>,
        mut other: Value,
    ) -> AccountResult<Account> {
        let email = extract_email_from_jwt(access_token);
        self.check_duplicate(refresh_token, email.as_deref()).await?;

        if let Some(token) = refresh_token {
            other["refreshTokenHash"] = Value::String(refresh_token_hash(token));
        }
        if let Some(email) = &email {
            other["email"] = Value::String(email.clone());
        }

        if refresh_token.is_none() {
            tracing::warn!(
                "Creating account without refresh token (label={}); it stays unusable until completed",
                label.unwrap_or("<unnamed>")
            );
        }

        let account_id = uuid::Uuid::new_v4().to_string();
        let now = now_iso();
        let expires_at = calc_expires_at(expires_in);
        let sql = self.db.sql(
            "INSERT INTO accounts (id, label, clientId, clientSecret, refreshToken, accessToken,
                expires_at, other, last_refresh_time, last_refresh_status, created_at, updated_at,
                enabled, error_count, success_count, quota_exhausted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0)",
        );
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(&account_id)
                    .bind(label)
                    .bind(client_id)
                    .bind(client_secret)
                    .bind(refresh_token)
                    .bind(access_token)
                    .bind(&expires_at)
                    .bind(serde_json::to_string(&other).ok())
                    .bind(&now)
                    .bind("success")
                    .bind(&now)
                    .bind(&now)
                    .bind(if enabled { 1i64 } else { 0i64 })
                    .execute(self.db.pool()),
            )
            .await?;

        self.get_account(&account_id).await
    }

    pub async fn delete_account(&self, account_id: &str) -> AccountResult<()> {
        let sql = self.db.sql("DELETE FROM accounts WHERE id=?");
        let result = self
            .db
            .timed(sqlx::query(&sql).bind(account_id).execute(self.db.pool()))
            .await?;
        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound);
        }
        Ok(())
    }

    pub async fn update_account(
        &self,
        account_id: &str,
        updates: AccountUpdate,
    ) -> AccountResult<Account> {
        let mut fields: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(label) = updates.label {
            fields.push("label=?");
            values.push(label);
        }
        if let Some(client_id) = updates.client_id {
            fields.push("clientId=?");
            values.push(client_id);
        }
        if let Some(client_secret) = updates.client_secret {
            fields.push("clientSecret=?");
            values.push(client_secret);
        }
        if let Some(refresh_token) = updates.refresh_token {
            fields.push("refreshToken=?");
            values.push(refresh_token);
        }
        if let Some(access_token) = updates.access_token {
            fields.push("accessToken=?");
            values.push(access_token);
        }
        if let Some(other) = updates.other {
            fields.push("other=?");
            values.push(serde_json::to_string(&other).unwrap_or_default());
        }
        if let Some(enabled) = updates.enabled {
            fields.push("enabled=?");
            values.push(if enabled { "1".into() } else { "0".into() });
        }

        if fields.is_empty() {
            return self.get_account(account_id).await;
        }

        fields.push("updated_at=?");
        values.push(now_iso());

        let sql = self.db.sql(&format!(
            "UPDATE accounts SET {} WHERE id=?",
            fields.join(", ")
        ));
        let mut query = sqlx::query(&sql);
        for value in &values {
            query = query.bind(value);
        }
        query = query.bind(account_id);

        let result = self.db.timed(query.execute(self.db.pool())).await?;
        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound);
        }
        self.get_account(account_id).await
    }

    pub async fn disable_account(&self, account_id: &str, reason: &str) -> AccountResult<()> {
        let now = now_iso();
        let sql = self
            .db
            .sql("UPDATE accounts SET enabled=0, last_refresh_status=?, updated_at=? WHERE id=?");
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(reason)
                    .bind(&now)
                    .bind(account_id)
                    .execute(self.db.pool()),
            )
            .await?;
        tracing::warn!("Account {} disabled: {}", account_id, reason);
        Ok(())
    }

    /// Atomic stats update; also records the quota counter.
    ///
    /// - success: success_count+1, error_count reset, quota flag cleared
    /// - quota exhaustion: sticky flag set and account disabled
    /// - other failure: error_count+1, disabling at the threshold inside the
    ///   same UPDATE
    pub async fn update_account_stats(
        &self,
        account_id: &str,
        success: bool,
        is_throttled: bool,
        quota_exhausted: bool,
    ) -> AccountResult<()> {
        if let Err(e) = self.quota.record_request(account_id, is_throttled).await {
            tracing::warn!("Quota recording failed for {}: {}", account_id, e);
        }

        let now = now_iso();
        if success {
            let sql = self.db.sql(
                "UPDATE accounts SET success_count=success_count+1, error_count=0, quota_exhausted=0, updated_at=? WHERE id=?",
            );
            self.db
                .timed(
                    sqlx::query(&sql)
                        .bind(&now)
                        .bind(account_id)
                        .execute(self.db.pool()),
                )
                .await?;
        } else if quota_exhausted {
            let sql = self
                .db
                .sql("UPDATE accounts SET quota_exhausted=1, enabled=0, updated_at=? WHERE id=?");
            self.db
                .timed(
                    sqlx::query(&sql)
                        .bind(&now)
                        .bind(account_id)
                        .execute(self.db.pool()),
                )
                .await?;
        } else {
            let sql = self.db.sql(
                "UPDATE accounts
                 SET error_count=error_count+1,
                     enabled=CASE WHEN error_count+1 >= ? THEN 0 ELSE enabled END,
                     updated_at=?
                 WHERE id=?",
            );
            self.db
                .timed(
                    sqlx::query(&sql)
                        .bind(self.max_error_count)
                        .bind(&now)
                        .bind(account_id)
                        .execute(self.db.pool()),
                )
                .await?;
        }

        if is_throttled {
            if let Err(e) = self.quota.update_quota_status(account_id).await {
                tracing::warn!("Quota status update failed for {}: {}", account_id, e);
            }
        }
        Ok(())
    }

    /// Classify an upstream failure and apply the per-type action.
    pub async fn handle_account_error(
        &self,
        account_id: &str,
        message: &str,
        status_code: Option<u16>,
        error_code: Option<&str>,
    ) -> AccountErrorType {
        let (error_type, reason) = detect_error_type(message, status_code, error_code);
        tracing::warn!(
            "Account {} error: type={}, reason={}",
            account_id,
            error_type.as_str(),
            reason
        );

        let outcome = if should_disable_account(error_type) {
            self.disable_account(account_id, &format!("{}: {}", error_type.as_str(), reason))
                .await
                .map_err(|e| e.to_string())
        } else if should_mark_rate_limited(error_type) {
            self.update_account_stats(account_id, false, true, false)
                .await
                .map_err(|e| e.to_string())
        } else if error_type == AccountErrorType::NetworkError {
            // Transient; the account is not at fault
            Ok(())
        } else {
            self.update_account_stats(account_id, false, false, false)
                .await
                .map_err(|e| e.to_string())
        };

        if let Err(e) = outcome {
            tracing::error!("Failed to record account error for {}: {}", account_id, e);
        }
        error_type
    }
}

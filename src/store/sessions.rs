//! Session stickiness
//!
//! Binds a conversation (identified by a hash of its opening messages) to
//! the account that served it, so follow-up turns reuse the same upstream
//! account and keep the conversation id meaningful.

use md5::{Digest, Md5};
use sqlx::Row;

use super::db::{Database, DbKind, DbResult, now_epoch};

/// Default binding lifetime
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

/// Session key: md5 over the first three messages' content (prefixed by the
/// user id when present), truncated to 16 hex chars.
pub fn generate_session_key(message_contents: &[String], user_id: Option<&str>) -> String {
    let mut content = String::new();
    for text in message_contents.iter().take(3) {
        content.push_str(text);
    }
    if let Some(uid) = user_id {
        content = format!("{}:{}", uid, content);
    }
    let digest = Md5::digest(content.as_bytes());
    hex::encode(digest)[..16].to_string()
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Account bound to this session, if the binding has not expired.
    pub async fn get_session_account(&self, session_key: &str) -> DbResult<Option<String>> {
        let sql = self.db.sql(
            "SELECT account_id FROM session_accounts WHERE session_key = ? AND expires_at > ?",
        );
        let row = self
            .db
            .timed(
                sqlx::query(&sql)
                    .bind(session_key)
                    .bind(now_epoch())
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        Ok(row.and_then(|r| r.try_get("account_id").ok()))
    }

    /// Bind (or re-bind) a session to an account.
    pub async fn bind_session_account(
        &self,
        session_key: &str,
        account_id: &str,
        ttl_secs: i64,
    ) -> DbResult<()> {
        let now = now_epoch();
        let expires_at = now + ttl_secs;

        let sql = match self.db.kind() {
            DbKind::MySql => {
                "REPLACE INTO session_accounts (session_key, account_id, expires_at, created_at)
                 VALUES (?, ?, ?, ?)"
            }
            _ => {
                "INSERT INTO session_accounts (session_key, account_id, expires_at, created_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(session_key) DO UPDATE SET
                    account_id = excluded.account_id,
                    expires_at = excluded.expires_at"
            }
        };
        let sql = self.db.sql(sql);

        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(session_key)
                    .bind(account_id)
                    .bind(expires_at)
                    .bind(now)
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    /// Drop expired bindings. Returns the number removed.
    pub async fn cleanup_expired_sessions(&self) -> DbResult<u64> {
        let sql = self.db.sql("DELETE FROM session_accounts WHERE expires_at <= ?");
        let result = self
            .db
            .timed(sqlx::query(&sql).bind(now_epoch()).execute(self.db.pool()))
            .await?;
        Ok(result.rows_affected())
    }
}

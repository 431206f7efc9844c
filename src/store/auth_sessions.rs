//! Device-code auth sessions
//!
//! In-flight device authorization flows live in a TTL'd LRU map (bounded so
//! abandoned flows cannot grow memory) and are mirrored to the
//! `auth_sessions` table so sibling workers can serve status polls.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use super::db::{Database, DbResult, now_epoch};

/// Terminal sessions older than this are reaped
pub const SESSION_REAP_AGE_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthSessionStatus {
    Pending,
    Completed,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlowKind {
    AmazonqBuilderId,
    KiroBuilderId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub auth_id: String,
    pub kind: AuthFlowKind,
    pub client_id: String,
    pub client_secret: String,
    pub device_code: String,
    pub user_code: Option<String>,
    pub verification_uri_complete: Option<String>,
    pub interval: u64,
    pub expires_in: u64,
    pub start_time: i64,
    pub label: Option<String>,
    pub enabled: bool,
    pub status: AuthSessionStatus,
    pub error: Option<String>,
    pub account_id: Option<String>,
}

struct TimedEntry {
    session: AuthSession,
    inserted: Instant,
}

/// LRU + TTL cache with a database mirror
pub struct AuthSessionStore {
    cache: Mutex<LruCache<String, TimedEntry>>,
    ttl: Duration,
    db: Database,
}

impl AuthSessionStore {
    pub fn new(db: Database, capacity: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(ttl_secs),
            db,
        }
    }

    fn sweep_expired(cache: &mut LruCache<String, TimedEntry>, ttl: Duration) {
        // LruCache has no retain; collect expired keys then pop
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.inserted.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            cache.pop(&key);
        }
    }

    /// Store a session in memory (TTL sweep + LRU eviction on every put)
    /// and persist the mirror row.
    pub async fn save(&self, session: &AuthSession) -> DbResult<()> {
        {
            let mut cache = self.cache.lock();
            Self::sweep_expired(&mut cache, self.ttl);
            cache.put(
                session.auth_id.clone(),
                TimedEntry {
                    session: session.clone(),
                    inserted: Instant::now(),
                },
            );
        }

        let payload = serde_json::to_string(session).unwrap_or_default();
        let sql = self.db.sql("DELETE FROM auth_sessions WHERE auth_id=?");
        self.db
            .timed(sqlx::query(&sql).bind(&session.auth_id).execute(self.db.pool()))
            .await?;
        let sql = self
            .db
            .sql("INSERT INTO auth_sessions (auth_id, payload, created_at) VALUES (?, ?, ?)");
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(&session.auth_id)
                    .bind(&payload)
                    .bind(now_epoch())
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    /// Load from the cache, falling back to the persisted mirror (covers
    /// flows started by another worker).
    pub async fn load(&self, auth_id: &str) -> DbResult<Option<AuthSession>> {
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(auth_id) {
                if entry.inserted.elapsed() <= self.ttl {
                    return Ok(Some(entry.session.clone()));
                }
                cache.pop(auth_id);
            }
        }

        let sql = self.db.sql("SELECT payload FROM auth_sessions WHERE auth_id=?");
        let row = self
            .db
            .timed(sqlx::query(&sql).bind(auth_id).fetch_optional(self.db.pool()))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload").unwrap_or_default();
        Ok(serde_json::from_str(&payload).ok())
    }

    pub async fn delete(&self, auth_id: &str) -> DbResult<()> {
        self.cache.lock().pop(auth_id);
        let sql = self.db.sql("DELETE FROM auth_sessions WHERE auth_id=?");
        self.db
            .timed(sqlx::query(&sql).bind(auth_id).execute(self.db.pool()))
            .await?;
        Ok(())
    }

    /// Drop persisted sessions older than the reap age. Returns the count.
    pub async fn reap_old_sessions(&self) -> DbResult<u64> {
        let cutoff = now_epoch() - SESSION_REAP_AGE_SECS;
        let sql = self.db.sql("DELETE FROM auth_sessions WHERE created_at < ?");
        let result = self
            .db
            .timed(sqlx::query(&sql).bind(cutoff).execute(self.db.pool()))
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(auth_id: &str) -> AuthSession {
        AuthSession {
            auth_id: auth_id.to_string(),
            kind: AuthFlowKind::KiroBuilderId,
            client_id: "cid".into(),
            client_secret: "csec".into(),
            device_code: "dev".into(),
            user_code: Some("ABCD-EFGH".into()),
            verification_uri_complete: Some("https://device.sso/start".into()),
            interval: 1,
            expires_in: 600,
            start_time: now_epoch(),
            label: None,
            enabled: true,
            status: AuthSessionStatus::Pending,
            error: None,
            account_id: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let db = Database::connect_memory().await.unwrap();
        let store = AuthSessionStore::new(db, 10, 600);

        store.save(&session("a1")).await.unwrap();
        let loaded = store.load("a1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AuthSessionStatus::Pending);
        assert_eq!(loaded.user_code.as_deref(), Some("ABCD-EFGH"));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_db_mirror() {
        let db = Database::connect_memory().await.unwrap();
        let store = AuthSessionStore::new(db.clone(), 10, 600);
        store.save(&session("a1")).await.unwrap();

        // A second store over the same database simulates another worker
        let other_worker = AuthSessionStore::new(db, 10, 600);
        let loaded = other_worker.load("a1").await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_db_mirror() {
        let db = Database::connect_memory().await.unwrap();
        let store = AuthSessionStore::new(db, 2, 600);

        store.save(&session("a1")).await.unwrap();
        store.save(&session("a2")).await.unwrap();
        store.save(&session("a3")).await.unwrap(); // evicts a1 from memory

        // Still resolvable via the mirror
        assert!(store.load("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_falls_back_to_mirror() {
        let db = Database::connect_memory().await.unwrap();
        let store = AuthSessionStore::new(db, 10, 0); // immediate expiry

        store.save(&session("a1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Memory entry is expired, DB mirror still answers
        assert!(store.load("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_and_reap() {
        let db = Database::connect_memory().await.unwrap();
        let store = AuthSessionStore::new(db, 10, 600);

        store.save(&session("a1")).await.unwrap();
        store.delete("a1").await.unwrap();
        assert!(store.load("a1").await.unwrap().is_none());

        store.save(&session("a2")).await.unwrap();
        // Nothing is old enough to reap yet
        assert_eq!(store.reap_old_sessions().await.unwrap(), 0);
    }
}

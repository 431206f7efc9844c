//! API key manager
//!
//! Issues, verifies, rotates and revokes `sk-` keys. Verification is
//! multi-layer: constant-time hash check, status and expiry, usage cap, IP
//! and User-Agent whitelists, per-key rate limit, and the failed-attempt
//! auditor. In-memory state is authoritative for the hot path; the
//! `secure_keys` table persists it. Mutations happen under the state lock;
//! database writes happen after it is released.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::rngs::OsRng;
use serde_json::Value;
use sqlx::Row;
use sqlx::any::AnyRow;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use super::crypto::KeyCipher;
use crate::store::db::{Database, DbResult};

const KEY_ID_HEX_CHARS: usize = 32;
const SALT_HEX_CHARS: usize = 64;
const KEY_BODY_CHARS: usize = 48;
const DEFAULT_KEY_LIFETIME_DAYS: i64 = 180;
const FAILED_ATTEMPT_WINDOW_SECS: i64 = 3600;
const IP_BLOCK_THRESHOLD: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Inactive,
    Compromised,
    Expired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Compromised => "compromised",
            Self::Expired => "expired",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "compromised" => Self::Compromised,
            "expired" => Self::Expired,
            _ => Self::Inactive,
        }
    }
}

/// Stored key row (plaintext never kept here)
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key_id: String,
    pub key_hash: String,
    pub salt: String,
    pub encrypted_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub max_uses: Option<i64>,
    pub allowed_ips: Vec<String>,
    pub allowed_user_agents: Vec<String>,
    pub allowed_account_ids: Vec<String>,
    pub default_account_id: Option<String>,
    pub rate_limit_per_minute: i64,
    pub status: KeyStatus,
    pub metadata: Value,
}

/// Issuance options
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub expires_in_days: Option<i64>,
    pub max_uses: Option<i64>,
    pub allowed_ips: Vec<String>,
    pub allowed_user_agents: Vec<String>,
    pub rate_limit_per_minute: Option<i64>,
    pub allowed_account_ids: Vec<String>,
    pub default_account_id: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Default)]
struct KeyState {
    keys: HashMap<String, KeyRecord>,
    /// lookup_hash -> key_id
    key_lookup: HashMap<String, String>,
    /// client ip -> failure timestamps (epoch secs)
    failed_attempts: HashMap<String, Vec<i64>>,
    /// key_id -> request timestamps inside the current minute
    rate_limits: HashMap<String, Vec<i64>>,
}

/// Database write deferred until the state lock is released
enum DeferredWrite {
    Usage(DateTime<Utc>, i64),
    Status(KeyStatus),
}

pub struct KeyManager {
    cipher: KeyCipher,
    db: Database,
    state: Mutex<KeyState>,
    strict_mode: bool,
    default_rate_limit: i64,
    max_failed_attempts: usize,
    block_duration_minutes: i64,
}

fn parse_json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn parse_dt(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn random_hex(chars: usize) -> String {
    let mut bytes = vec![0u8; chars / 2];
    OsRng.fill(&mut bytes[..]);
    hex::encode(bytes)
}

fn random_key_body() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = OsRng;
    (0..KEY_BODY_CHARS)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Minute-window rate limiter over a timestamp list.
fn rate_limit_allows(timestamps: &mut Vec<i64>, limit: i64) -> bool {
    let now = Utc::now().timestamp();
    let minute_start = now - now % 60;
    timestamps.retain(|ts| *ts >= minute_start);
    if timestamps.len() as i64 >= limit {
        return false;
    }
    timestamps.push(now);
    true
}

impl KeyManager {
    pub fn new(cipher: KeyCipher, db: Database, strict_mode: bool, default_rate_limit: i64) -> Self {
        Self {
            cipher,
            db,
            state: Mutex::new(KeyState::default()),
            strict_mode,
            default_rate_limit,
            max_failed_attempts: if strict_mode { 3 } else { 5 },
            block_duration_minutes: if strict_mode { 60 } else { 30 },
        }
    }

    /// Issue a new key. Returns `(key_id, plaintext)`; the plaintext is
    /// shown once and only recoverable via the encrypted copy.
    pub async fn generate_secure_key(&self, opts: KeyOptions) -> DbResult<(String, String)> {
        let key_id = random_hex(KEY_ID_HEX_CHARS);
        let salt = random_hex(SALT_HEX_CHARS);
        let api_key = format!("sk-{}", random_key_body());

        let key_hash = self.cipher.hash_key(&api_key, &salt);
        let lookup_hash = self.cipher.lookup_hash(&api_key);
        let encrypted_key = self.cipher.encrypt_key(&api_key).ok();

        let mut allowed_accounts: Vec<String> = opts
            .allowed_account_ids
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        let default_account_id = opts
            .default_account_id
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        if let Some(default) = &default_account_id {
            if !allowed_accounts.contains(default) {
                allowed_accounts.push(default.clone());
            }
        }

        let record = KeyRecord {
            key_id: key_id.clone(),
            key_hash,
            salt,
            encrypted_key,
            created_at: Utc::now(),
            expires_at: Some(
                Utc::now()
                    + Duration::days(opts.expires_in_days.unwrap_or(DEFAULT_KEY_LIFETIME_DAYS)),
            ),
            last_used: None,
            usage_count: 0,
            max_uses: opts.max_uses,
            allowed_ips: opts.allowed_ips,
            allowed_user_agents: opts.allowed_user_agents,
            allowed_account_ids: allowed_accounts,
            default_account_id,
            rate_limit_per_minute: opts.rate_limit_per_minute.unwrap_or(self.default_rate_limit),
            status: KeyStatus::Active,
            metadata: opts.metadata.unwrap_or_else(|| Value::Object(Default::default())),
        };

        self.save_key_to_db(&record, &lookup_hash).await?;

        let mut state = self.state.lock();
        state.keys.insert(key_id.clone(), record);
        state.key_lookup.insert(lookup_hash, key_id.clone());
        drop(state);

        tracing::info!("Issued API key {}", key_id);
        Ok((key_id, api_key))
    }

    async fn save_key_to_db(&self, record: &KeyRecord, lookup_hash: &str) -> DbResult<()> {
        let sql = self.db.sql(
            "INSERT INTO secure_keys (
                key_id, key_hash, salt, encrypted_key, lookup_hash, created_at, expires_at,
                last_used, usage_count, max_uses, allowed_ips, allowed_user_agents,
                allowed_accounts, default_account_id, rate_limit_per_minute, status,
                security_level, metadata
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(&record.key_id)
                    .bind(&record.key_hash)
                    .bind(&record.salt)
                    .bind(&record.encrypted_key)
                    .bind(lookup_hash)
                    .bind(fmt_dt(&record.created_at))
                    .bind(record.expires_at.as_ref().map(fmt_dt))
                    .bind(record.last_used.as_ref().map(fmt_dt))
                    .bind(record.usage_count)
                    .bind(record.max_uses)
                    .bind(serde_json::to_string(&record.allowed_ips).ok())
                    .bind(serde_json::to_string(&record.allowed_user_agents).ok())
                    .bind(serde_json::to_string(&record.allowed_account_ids).ok())
                    .bind(&record.default_account_id)
                    .bind(record.rate_limit_per_minute)
                    .bind(record.status.as_str())
                    .bind(if self.strict_mode { "military" } else { "production" })
                    .bind(serde_json::to_string(&record.metadata).ok())
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    fn record_from_row(&self, row: &AnyRow) -> KeyRecord {
        KeyRecord {
            key_id: row.try_get("key_id").unwrap_or_default(),
            key_hash: row.try_get("key_hash").unwrap_or_default(),
            salt: row.try_get("salt").unwrap_or_default(),
            encrypted_key: row.try_get("encrypted_key").ok(),
            created_at: parse_dt(row.try_get("created_at").ok()).unwrap_or_else(Utc::now),
            expires_at: parse_dt(row.try_get("expires_at").ok()),
            last_used: parse_dt(row.try_get("last_used").ok()),
            usage_count: row.try_get("usage_count").unwrap_or(0),
            max_uses: row.try_get("max_uses").ok(),
            allowed_ips: parse_json_list(row.try_get("allowed_ips").ok()),
            allowed_user_agents: parse_json_list(row.try_get("allowed_user_agents").ok()),
            allowed_account_ids: parse_json_list(row.try_get("allowed_accounts").ok()),
            default_account_id: row.try_get("default_account_id").ok(),
            rate_limit_per_minute: row
                .try_get("rate_limit_per_minute")
                .unwrap_or(self.default_rate_limit),
            status: KeyStatus::from_str(
                row.try_get::<String, _>("status")
                    .as_deref()
                    .unwrap_or("inactive"),
            ),
            metadata: row
                .try_get::<String, _>("metadata")
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_else(|| Value::Object(Default::default())),
        }
    }

    /// Load all active keys from the database into the cache. Legacy
    /// encrypted blobs are re-encrypted with the AEAD envelope.
    pub async fn load_keys_from_db(&self) -> DbResult<usize> {
        let sql = self.db.sql("SELECT * FROM secure_keys WHERE status = 'active'");
        let rows = self.db.timed(sqlx::query(&sql).fetch_all(self.db.pool())).await?;

        let mut loaded = 0usize;
        for row in &rows {
            let mut record = self.record_from_row(row);

            if let Some(expires_at) = record.expires_at {
                if Utc::now() > expires_at {
                    self.update_key_status_in_db(&record.key_id, KeyStatus::Expired)
                        .await?;
                    tracing::info!("Key expired on load: {}", record.key_id);
                    continue;
                }
            }

            let lookup_hash = match record.encrypted_key.as_deref() {
                Some(blob) => {
                    let (plain, needs_upgrade) = self.cipher.decrypt_key_with_metadata(blob);
                    match plain {
                        Some(plain) => {
                            if needs_upgrade {
                                self.upgrade_legacy_key(&mut record, &plain).await;
                            }
                            Some(self.cipher.lookup_hash(&plain))
                        }
                        None => None,
                    }
                }
                None => None,
            };
            // Stored lookup hash covers rows whose blob cannot decrypt
            let lookup_hash = lookup_hash.or_else(|| row.try_get::<String, _>("lookup_hash").ok());

            let mut state = self.state.lock();
            if let Some(hash) = lookup_hash {
                state.key_lookup.insert(hash, record.key_id.clone());
            }
            state.keys.insert(record.key_id.clone(), record);
            loaded += 1;
        }

        tracing::info!("Loaded {} active API keys", loaded);
        Ok(loaded)
    }

    async fn upgrade_legacy_key(&self, record: &mut KeyRecord, plaintext: &str) {
        let Ok(new_blob) = self.cipher.encrypt_key(plaintext) else {
            tracing::error!("Failed to re-encrypt legacy key {}", record.key_id);
            return;
        };
        record.encrypted_key = Some(new_blob.clone());
        let sql = self.db.sql("UPDATE secure_keys SET encrypted_key=? WHERE key_id=?");
        match self
            .db
            .timed(
                sqlx::query(&sql)
                    .bind(&new_blob)
                    .bind(&record.key_id)
                    .execute(self.db.pool()),
            )
            .await
        {
            Ok(_) => tracing::info!("Upgraded key encryption format: {}", record.key_id),
            Err(e) => tracing::error!("Failed to persist upgraded key {}: {}", record.key_id, e),
        }
    }

    pub async fn update_key_status_in_db(&self, key_id: &str, status: KeyStatus) -> DbResult<()> {
        let sql = self.db.sql("UPDATE secure_keys SET status = ? WHERE key_id = ?");
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .bind(key_id)
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    async fn update_key_usage_in_db(
        &self,
        key_id: &str,
        last_used: DateTime<Utc>,
        usage_count: i64,
    ) -> DbResult<()> {
        let sql = self
            .db
            .sql("UPDATE secure_keys SET last_used = ?, usage_count = ? WHERE key_id = ?");
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(fmt_dt(&last_used))
                    .bind(usage_count)
                    .bind(key_id)
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    /// Lazily resolve a key by hashing against every active row's salt.
    /// Only runs on a cache miss; the matching row is cached after.
    async fn load_key_by_plaintext(&self, api_key: &str) -> Option<String> {
        let sql = self.db.sql("SELECT * FROM secure_keys WHERE status = 'active'");
        let rows = self
            .db
            .timed(sqlx::query(&sql).fetch_all(self.db.pool()))
            .await
            .ok()?;

        for row in &rows {
            let record = self.record_from_row(row);
            let expected = self.cipher.hash_key(api_key, &record.salt);
            let matches: bool = expected
                .as_bytes()
                .ct_eq(record.key_hash.as_bytes())
                .into();
            if !matches {
                continue;
            }

            let key_id = record.key_id.clone();
            let lookup_hash = self.cipher.lookup_hash(api_key);
            let mut state = self.state.lock();
            state.keys.insert(key_id.clone(), record);
            state.key_lookup.insert(lookup_hash, key_id.clone());
            return Some(key_id);
        }
        None
    }

    /// Verify an API key. Returns the record on success, `None` on any
    /// failure. IP/UA/rate-limit rejections never increment usage.
    pub async fn verify_key(
        &self,
        api_key: &str,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<KeyRecord> {
        if api_key.is_empty() || !api_key.starts_with("sk-") {
            tracing::warn!("Rejected key with invalid format");
            return None;
        }

        let lookup_hash = self.cipher.lookup_hash(api_key);
        let cached_id = self.state.lock().key_lookup.get(&lookup_hash).cloned();
        let key_id = match cached_id {
            Some(id) => id,
            None => match self.load_key_by_plaintext(api_key).await {
                Some(id) => id,
                None => {
                    tracing::warn!("API key not found");
                    self.record_failed_attempt(client_ip, "unknown");
                    return None;
                }
            },
        };

        let mut deferred: Vec<DeferredWrite> = Vec::new();
        let mut result: Option<KeyRecord> = None;
        let mut attribute_failure = false;

        {
            let mut state = self.state.lock();
            let blocked = client_ip
                .map(|ip| Self::blocked_inner(&state.failed_attempts, ip, self.block_duration_minutes))
                .unwrap_or(false);

            // Snapshot for read-only checks; the live entry is mutated at
            // the end of the pass
            let snapshot = state.keys.get(&key_id)?.clone();

            let expected = self.cipher.hash_key(api_key, &snapshot.salt);
            let hash_ok: bool = expected
                .as_bytes()
                .ct_eq(snapshot.key_hash.as_bytes())
                .into();

            if !hash_ok {
                tracing::warn!("Key hash verification failed: {}", key_id);
                attribute_failure = true;
            } else if snapshot.status != KeyStatus::Active {
                tracing::warn!("Key {} not active: {}", key_id, snapshot.status.as_str());
            } else if snapshot
                .expires_at
                .map(|expires| Utc::now() > expires)
                .unwrap_or(false)
            {
                tracing::warn!("Key expired: {}", key_id);
                if let Some(record) = state.keys.get_mut(&key_id) {
                    record.status = KeyStatus::Expired;
                }
                deferred.push(DeferredWrite::Status(KeyStatus::Expired));
            } else if snapshot
                .max_uses
                .map(|max| snapshot.usage_count >= max)
                .unwrap_or(false)
            {
                tracing::warn!("Key usage cap reached: {}", key_id);
                if let Some(record) = state.keys.get_mut(&key_id) {
                    record.status = KeyStatus::Inactive;
                }
                deferred.push(DeferredWrite::Status(KeyStatus::Inactive));
            } else if !snapshot.allowed_ips.is_empty()
                && client_ip
                    .map(|ip| !snapshot.allowed_ips.iter().any(|allowed| allowed == ip))
                    .unwrap_or(false)
            {
                tracing::warn!("IP not in key whitelist: {:?}", client_ip);
                attribute_failure = true;
            } else if !snapshot.allowed_user_agents.is_empty()
                && user_agent
                    .map(|ua| {
                        let ua_lower = ua.to_lowercase();
                        !snapshot
                            .allowed_user_agents
                            .iter()
                            .any(|allowed| ua_lower.contains(&allowed.to_lowercase()))
                    })
                    .unwrap_or(false)
            {
                tracing::warn!("User-Agent not in key whitelist");
                attribute_failure = true;
            } else if !rate_limit_allows(
                state.rate_limits.entry(key_id.clone()).or_default(),
                snapshot.rate_limit_per_minute,
            ) {
                tracing::warn!("Rate limit hit for key {}", key_id);
            } else if blocked {
                tracing::warn!("Blocked IP rejected: {:?}", client_ip);
            } else {
                let now = Utc::now();
                if let Some(record) = state.keys.get_mut(&key_id) {
                    record.usage_count += 1;
                    record.last_used = Some(now);
                    deferred.push(DeferredWrite::Usage(now, record.usage_count));
                    result = Some(record.clone());
                }
                if let Some(ip) = client_ip {
                    state.failed_attempts.remove(ip);
                }
            }
        }

        if attribute_failure {
            self.record_failed_attempt(client_ip, &key_id);
        }
        for write in deferred {
            let outcome = match write {
                DeferredWrite::Status(status) => self.update_key_status_in_db(&key_id, status).await,
                DeferredWrite::Usage(last_used, count) => {
                    self.update_key_usage_in_db(&key_id, last_used, count).await
                }
            };
            if let Err(e) = outcome {
                tracing::warn!("Failed to persist key state for {}: {}", key_id, e);
            }
        }

        result
    }

    fn blocked_inner(
        failed_attempts: &HashMap<String, Vec<i64>>,
        client_ip: &str,
        block_duration_minutes: i64,
    ) -> bool {
        let Some(attempts) = failed_attempts.get(client_ip) else {
            return false;
        };
        let cutoff = Utc::now().timestamp() - block_duration_minutes * 60;
        attempts.iter().filter(|ts| **ts > cutoff).count() > IP_BLOCK_THRESHOLD
    }

    /// True when an IP is currently rate-blocked by the auditor.
    pub fn is_ip_blocked(&self, client_ip: &str) -> bool {
        Self::blocked_inner(
            &self.state.lock().failed_attempts,
            client_ip,
            self.block_duration_minutes,
        )
    }

    /// Record a failed verification attempt for an IP. Crossing the per-key
    /// threshold marks the key compromised.
    fn record_failed_attempt(&self, client_ip: Option<&str>, key_id: &str) {
        let Some(ip) = client_ip else {
            return;
        };
        let now = Utc::now().timestamp();
        let cutoff = now - FAILED_ATTEMPT_WINDOW_SECS;

        let mut state = self.state.lock();
        let attempts = state.failed_attempts.entry(ip.to_string()).or_default();
        attempts.push(now);
        attempts.retain(|ts| *ts > cutoff);
        let recent = attempts.len();

        if recent >= self.max_failed_attempts {
            tracing::error!(
                "Suspicious activity: key {} may be compromised (ip {}, {} failures/h)",
                key_id,
                ip,
                recent
            );
            if let Some(record) = state.keys.get_mut(key_id) {
                record.status = KeyStatus::Compromised;
            }
        }
    }

    /// Revoke a key (set inactive) and persist the status.
    pub async fn revoke_key(&self, key_id: &str, reason: &str) -> bool {
        let found = {
            let mut state = self.state.lock();
            match state.keys.get_mut(key_id) {
                Some(record) => {
                    record.status = KeyStatus::Inactive;
                    true
                }
                None => false,
            }
        };
        if found {
            if let Err(e) = self.update_key_status_in_db(key_id, KeyStatus::Inactive).await {
                tracing::warn!("Failed to persist revocation of {}: {}", key_id, e);
            }
            tracing::info!("Key revoked: {} ({})", key_id, reason);
        }
        found
    }

    /// Rotate: issue a new key copying the ACL and metadata, revoke the old.
    pub async fn rotate_key(&self, key_id: &str) -> Option<(String, String)> {
        let old = self.state.lock().keys.get(key_id).cloned()?;

        let opts = KeyOptions {
            expires_in_days: None,
            max_uses: old.max_uses,
            allowed_ips: old.allowed_ips.clone(),
            allowed_user_agents: old.allowed_user_agents.clone(),
            rate_limit_per_minute: Some(old.rate_limit_per_minute),
            allowed_account_ids: old.allowed_account_ids.clone(),
            default_account_id: old.default_account_id.clone(),
            metadata: Some(old.metadata.clone()),
        };
        let (new_id, new_key) = match self.generate_secure_key(opts).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("Rotation failed for {}: {}", key_id, e);
                return None;
            }
        };

        self.revoke_key(key_id, "key rotation").await;
        tracing::info!("Key rotated: {} -> {}", key_id, new_id);
        Some((new_id, new_key))
    }

    /// Decrypt the stored plaintext of an active key (admin recovery).
    pub fn get_decrypted_key(&self, key_id: &str) -> Option<String> {
        let state = self.state.lock();
        let record = state.keys.get(key_id)?;
        if record.status != KeyStatus::Active {
            tracing::warn!(
                "Refusing to decrypt non-active key {} ({})",
                key_id,
                record.status.as_str()
            );
            return None;
        }
        self.cipher.decrypt_key(record.encrypted_key.as_deref()?)
    }

    pub fn get_key(&self, key_id: &str) -> Option<KeyRecord> {
        self.state.lock().keys.get(key_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::crypto::MasterKey;

    async fn manager() -> KeyManager {
        let db = Database::connect_memory().await.unwrap();
        let cipher = KeyCipher::new(MasterKey::from_bytes(vec![3u8; 64]).unwrap());
        KeyManager::new(cipher, db, false, 300)
    }

    #[tokio::test]
    async fn test_generate_and_verify() {
        let manager = manager().await;
        let (key_id, api_key) = manager
            .generate_secure_key(KeyOptions::default())
            .await
            .unwrap();

        assert_eq!(key_id.len(), 32);
        assert!(api_key.starts_with("sk-"));
        assert_eq!(api_key.len(), 51);

        let record = manager
            .verify_key(&api_key, Some("1.2.3.4"), Some("test-agent"))
            .await
            .expect("verification succeeds");
        assert_eq!(record.key_id, key_id);
        assert_eq!(record.usage_count, 1);
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_format_and_unknown() {
        let manager = manager().await;
        assert!(manager.verify_key("", None, None).await.is_none());
        assert!(manager.verify_key("pk-wrongprefix", None, None).await.is_none());
        let fake = format!("sk-{}", "a".repeat(48));
        assert!(manager.verify_key(&fake, Some("9.9.9.9"), None).await.is_none());
    }

    #[tokio::test]
    async fn test_lazy_db_load_after_cache_miss() {
        let manager = manager().await;
        let (_, api_key) = manager
            .generate_secure_key(KeyOptions::default())
            .await
            .unwrap();

        // Simulate a fresh worker: empty cache, same database
        {
            let mut state = manager.state.lock();
            state.keys.clear();
            state.key_lookup.clear();
        }

        assert!(manager.verify_key(&api_key, None, None).await.is_some());
    }

    #[tokio::test]
    async fn test_max_uses_transitions_inactive() {
        let manager = manager().await;
        let (key_id, api_key) = manager
            .generate_secure_key(KeyOptions {
                max_uses: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(manager.verify_key(&api_key, None, None).await.is_some());
        assert!(manager.verify_key(&api_key, None, None).await.is_some());
        // Third attempt trips the cap and deactivates
        assert!(manager.verify_key(&api_key, None, None).await.is_none());
        assert_eq!(manager.get_key(&key_id).unwrap().status, KeyStatus::Inactive);
        // Usage stopped at the cap; the denied attempt did not count
        assert_eq!(manager.get_key(&key_id).unwrap().usage_count, 2);
    }

    #[tokio::test]
    async fn test_ip_whitelist_rejection_does_not_count_usage() {
        let manager = manager().await;
        let (key_id, api_key) = manager
            .generate_secure_key(KeyOptions {
                allowed_ips: vec!["10.0.0.1".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(
            manager
                .verify_key(&api_key, Some("10.0.0.2"), None)
                .await
                .is_none()
        );
        assert_eq!(manager.get_key(&key_id).unwrap().usage_count, 0);

        assert!(
            manager
                .verify_key(&api_key, Some("10.0.0.1"), None)
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_user_agent_substring_match() {
        let manager = manager().await;
        let (_, api_key) = manager
            .generate_secure_key(KeyOptions {
                allowed_user_agents: vec!["claude-cli".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(
            manager
                .verify_key(&api_key, None, Some("Claude-CLI/1.2 (linux)"))
                .await
                .is_some()
        );
        assert!(
            manager
                .verify_key(&api_key, None, Some("curl/8.0"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_rate_limit_denies_without_usage() {
        let manager = manager().await;
        let (key_id, api_key) = manager
            .generate_secure_key(KeyOptions {
                rate_limit_per_minute: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(manager.verify_key(&api_key, None, None).await.is_some());
        assert!(manager.verify_key(&api_key, None, None).await.is_some());
        assert!(manager.verify_key(&api_key, None, None).await.is_none());
        assert_eq!(manager.get_key(&key_id).unwrap().usage_count, 2);
        // Still active: a rate limit is not a compromise
        assert_eq!(manager.get_key(&key_id).unwrap().status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_attempts_mark_compromised() {
        let manager = manager().await; // threshold 5 in production mode
        let (listed_id, listed_key) = manager
            .generate_secure_key(KeyOptions {
                allowed_ips: vec!["10.0.0.1".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..5 {
            manager.verify_key(&listed_key, Some("7.7.7.7"), None).await;
        }
        assert_eq!(
            manager.get_key(&listed_id).unwrap().status,
            KeyStatus::Compromised
        );
    }

    #[tokio::test]
    async fn test_rotate_copies_acl_and_revokes_old() {
        let manager = manager().await;
        let (old_id, old_key) = manager
            .generate_secure_key(KeyOptions {
                allowed_account_ids: vec!["acc-1".into()],
                default_account_id: Some("acc-1".into()),
                rate_limit_per_minute: Some(42),
                ..Default::default()
            })
            .await
            .unwrap();

        let (new_id, new_key) = manager.rotate_key(&old_id).await.unwrap();
        assert_ne!(old_id, new_id);

        let new_record = manager.get_key(&new_id).unwrap();
        assert_eq!(new_record.allowed_account_ids, vec!["acc-1".to_string()]);
        assert_eq!(new_record.rate_limit_per_minute, 42);

        assert!(manager.verify_key(&old_key, None, None).await.is_none());
        assert!(manager.verify_key(&new_key, None, None).await.is_some());
    }

    #[tokio::test]
    async fn test_load_keys_from_db_round_trip() {
        let db = Database::connect_memory().await.unwrap();
        let cipher = KeyCipher::new(MasterKey::from_bytes(vec![3u8; 64]).unwrap());
        let manager = KeyManager::new(cipher, db.clone(), false, 300);
        let (_, api_key) = manager
            .generate_secure_key(KeyOptions::default())
            .await
            .unwrap();

        // Second manager over the same database (process restart)
        let cipher2 = KeyCipher::new(MasterKey::from_bytes(vec![3u8; 64]).unwrap());
        let restarted = KeyManager::new(cipher2, db, false, 300);
        let loaded = restarted.load_keys_from_db().await.unwrap();
        assert_eq!(loaded, 1);
        assert!(restarted.verify_key(&api_key, None, None).await.is_some());
    }

    #[tokio::test]
    async fn test_default_account_joins_acl() {
        let manager = manager().await;
        let (key_id, _) = manager
            .generate_secure_key(KeyOptions {
                allowed_account_ids: vec!["acc-a".into()],
                default_account_id: Some("acc-b".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let record = manager.get_key(&key_id).unwrap();
        assert!(record.allowed_account_ids.contains(&"acc-a".to_string()));
        assert!(record.allowed_account_ids.contains(&"acc-b".to_string()));
    }

    #[tokio::test]
    async fn test_decrypted_key_recovery() {
        let manager = manager().await;
        let (key_id, api_key) = manager
            .generate_secure_key(KeyOptions::default())
            .await
            .unwrap();
        assert_eq!(
            manager.get_decrypted_key(&key_id).as_deref(),
            Some(api_key.as_str())
        );

        manager.revoke_key(&key_id, "test").await;
        assert!(manager.get_decrypted_key(&key_id).is_none());
    }
}

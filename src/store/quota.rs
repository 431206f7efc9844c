//! Monthly quota tracking
//!
//! Per-account request and throttle counters keyed by the current UTC
//! month. Status is derived from the throttle history and drives the quota
//! views exposed to operators.

use sqlx::Row;

use super::db::{Database, DbKind, DbResult, now_epoch};

/// Throttle ratio thresholds for status derivation
const WARNING_THRESHOLD: f64 = 0.8;
const CRITICAL_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct QuotaStats {
    pub account_id: String,
    pub month: String,
    pub request_count: i64,
    pub throttle_count: i64,
    pub last_throttle_time: Option<i64>,
    pub quota_status: String,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct QuotaTracker {
    db: Database,
}

/// Current UTC month key, `YYYY-MM`.
pub fn month_key() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

fn derive_status(request_count: i64, throttle_count: i64) -> &'static str {
    if throttle_count > 0 {
        return "exhausted";
    }
    if request_count > 0 {
        let ratio = throttle_count as f64 / request_count as f64;
        if ratio >= CRITICAL_THRESHOLD {
            return "critical";
        }
        if ratio >= WARNING_THRESHOLD {
            return "warning";
        }
    }
    "normal"
}

impl QuotaTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record one upstream attempt (and optionally a throttle) via upsert.
    pub async fn record_request(&self, account_id: &str, is_throttled: bool) -> DbResult<()> {
        let month = month_key();
        let now = now_epoch();

        let sql = match (self.db.kind(), is_throttled) {
            (DbKind::MySql, true) => {
                "INSERT INTO quota_stats (account_id, month_key, request_count, throttle_count, last_throttle_time, created_at, updated_at)
                 VALUES (?, ?, 1, 1, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    request_count = request_count + 1,
                    throttle_count = throttle_count + 1,
                    last_throttle_time = VALUES(last_throttle_time),
                    updated_at = VALUES(updated_at)"
            }
            (DbKind::MySql, false) => {
                "INSERT INTO quota_stats (account_id, month_key, request_count, created_at, updated_at)
                 VALUES (?, ?, 1, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    request_count = request_count + 1,
                    updated_at = VALUES(updated_at)"
            }
            (_, true) => {
                "INSERT INTO quota_stats (account_id, month_key, request_count, throttle_count, last_throttle_time, created_at, updated_at)
                 VALUES (?, ?, 1, 1, ?, ?, ?)
                 ON CONFLICT(account_id) DO UPDATE SET
                    request_count = quota_stats.request_count + 1,
                    throttle_count = quota_stats.throttle_count + 1,
                    last_throttle_time = excluded.last_throttle_time,
                    month_key = excluded.month_key,
                    updated_at = excluded.updated_at"
            }
            (_, false) => {
                "INSERT INTO quota_stats (account_id, month_key, request_count, created_at, updated_at)
                 VALUES (?, ?, 1, ?, ?)
                 ON CONFLICT(account_id) DO UPDATE SET
                    request_count = quota_stats.request_count + 1,
                    month_key = excluded.month_key,
                    updated_at = excluded.updated_at"
            }
        };
        let sql = self.db.sql(sql);

        let query = if is_throttled {
            sqlx::query(&sql)
                .bind(account_id)
                .bind(&month)
                .bind(now)
                .bind(now)
                .bind(now)
        } else {
            sqlx::query(&sql)
                .bind(account_id)
                .bind(&month)
                .bind(now)
                .bind(now)
        };
        self.db.timed(query.execute(self.db.pool())).await?;
        Ok(())
    }

    /// Re-derive and store the quota status for an account.
    pub async fn update_quota_status(&self, account_id: &str) -> DbResult<Option<String>> {
        let month = month_key();
        let sql = self.db.sql(
            "SELECT request_count, throttle_count FROM quota_stats WHERE account_id = ? AND month_key = ?",
        );
        let row = self
            .db
            .timed(
                sqlx::query(&sql)
                    .bind(account_id)
                    .bind(&month)
                    .fetch_optional(self.db.pool()),
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let request_count: i64 = row.try_get("request_count").unwrap_or(0);
        let throttle_count: i64 = row.try_get("throttle_count").unwrap_or(0);
        let status = derive_status(request_count, throttle_count);

        let sql = self.db.sql(
            "UPDATE quota_stats SET quota_status = ?, updated_at = ? WHERE account_id = ? AND month_key = ?",
        );
        self.db
            .timed(
                sqlx::query(&sql)
                    .bind(status)
                    .bind(now_epoch())
                    .bind(account_id)
                    .bind(&month)
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(Some(status.to_string()))
    }

    pub async fn get_stats(&self, account_id: &str) -> DbResult<Option<QuotaStats>> {
        let month = month_key();
        let sql = self.db.sql(
            "SELECT request_count, throttle_count, last_throttle_time, quota_status, updated_at
             FROM quota_stats WHERE account_id = ? AND month_key = ?",
        );
        let row = self
            .db
            .timed(
                sqlx::query(&sql)
                    .bind(account_id)
                    .bind(&month)
                    .fetch_optional(self.db.pool()),
            )
            .await?;

        Ok(row.map(|row| QuotaStats {
            account_id: account_id.to_string(),
            month,
            request_count: row.try_get("request_count").unwrap_or(0),
            throttle_count: row.try_get("throttle_count").unwrap_or(0),
            last_throttle_time: row.try_get("last_throttle_time").ok(),
            quota_status: row
                .try_get("quota_status")
                .unwrap_or_else(|_| "normal".to_string()),
            updated_at: row.try_get("updated_at").unwrap_or(0),
        }))
    }

    pub async fn list_stats(&self) -> DbResult<Vec<QuotaStats>> {
        let month = month_key();
        let sql = self.db.sql(
            "SELECT account_id, request_count, throttle_count, last_throttle_time, quota_status, updated_at
             FROM quota_stats WHERE month_key = ?
             ORDER BY throttle_count DESC, request_count DESC",
        );
        let rows = self
            .db
            .timed(sqlx::query(&sql).bind(&month).fetch_all(self.db.pool()))
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| QuotaStats {
                account_id: row.try_get("account_id").unwrap_or_default(),
                month: month.clone(),
                request_count: row.try_get("request_count").unwrap_or(0),
                throttle_count: row.try_get("throttle_count").unwrap_or(0),
                last_throttle_time: row.try_get("last_throttle_time").ok(),
                quota_status: row
                    .try_get("quota_status")
                    .unwrap_or_else(|_| "normal".to_string()),
                updated_at: row.try_get("updated_at").unwrap_or(0),
            })
            .collect())
    }
}

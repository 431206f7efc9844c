//! Security audit log
//!
//! Append-only record of authentication events, backing the operator
//! views. Writes are best-effort: an audit failure never blocks a request.

use super::db::Database;

#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event. Errors are logged and swallowed.
    pub async fn record(
        &self,
        event_type: &str,
        client_ip: &str,
        details: &str,
        user_agent: Option<&str>,
    ) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let details: String = details.chars().take(500).collect();
        let user_agent: Option<String> =
            user_agent.map(|ua| ua.chars().take(200).collect());

        let sql = self.db.sql(
            "INSERT INTO audit_logs (timestamp, event_type, client_ip, details, user_agent)
             VALUES (?, ?, ?, ?, ?)",
        );
        let result = self
            .db
            .timed(
                sqlx::query(&sql)
                    .bind(&timestamp)
                    .bind(event_type)
                    .bind(client_ip)
                    .bind(&details)
                    .bind(&user_agent)
                    .execute(self.db.pool()),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("Audit log write failed ({}): {}", event_type, e);
        }
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: i64) -> Vec<(String, String, String)> {
        use sqlx::Row;

        let sql = self.db.sql(
            "SELECT timestamp, event_type, client_ip FROM audit_logs
             ORDER BY timestamp DESC LIMIT ?",
        );
        match self
            .db
            .timed(sqlx::query(&sql).bind(limit).fetch_all(self.db.pool()))
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|row| {
                    (
                        row.try_get("timestamp").unwrap_or_default(),
                        row.try_get("event_type").unwrap_or_default(),
                        row.try_get("client_ip").unwrap_or_default(),
                    )
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Audit log read failed: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let db = Database::connect_memory().await.unwrap();
        let audit = AuditLog::new(db);

        audit
            .record("auth_failed", "1.2.3.4", "bad key format", Some("curl/8"))
            .await;
        audit.record("auth_failed", "1.2.3.4", "unknown key", None).await;

        let recent = audit.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1, "auth_failed");
        assert_eq!(recent[0].2, "1.2.3.4");
    }

    #[tokio::test]
    async fn test_oversized_details_truncated() {
        let db = Database::connect_memory().await.unwrap();
        let audit = AuditLog::new(db);
        let huge = "x".repeat(10_000);
        audit.record("probe", "9.9.9.9", &huge, None).await;
        assert_eq!(audit.recent(1).await.len(), 1);
    }
}

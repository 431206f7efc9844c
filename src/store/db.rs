//! Persistence backend
//!
//! One `Database` wraps a `sqlx::AnyPool` over SQLite (default), PostgreSQL
//! or MySQL, selected by the `DATABASE_URL` scheme. Placeholders are written
//! as `?` and rewritten to `$n` for Postgres. Every query runs under the
//! configured timeout. Migrations are additive: CREATE TABLE IF NOT EXISTS
//! plus column probes guarding ALTER TABLE ADD COLUMN.

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::time::Duration;
use thiserror::Error;

use crate::model::config::Config;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database query timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("row not found")]
    NotFound,
}

pub type DbResult<T> = Result<T, DbError>;

/// Selected backend dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
    MySql,
}

/// Default embedded database location
pub const DEFAULT_SQLITE_PATH: &str = "data/database/data.sqlite3";

#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    kind: DbKind,
    timeout: Duration,
}

fn kind_from_url(url: &str) -> DbKind {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        DbKind::Postgres
    } else if url.starts_with("mysql://") {
        DbKind::MySql
    } else {
        DbKind::Sqlite
    }
}

impl Database {
    /// Connect and migrate.
    pub async fn connect(config: &Config) -> DbResult<Self> {
        sqlx::any::install_default_drivers();

        let kind = kind_from_url(&config.database_url);
        let url = match kind {
            DbKind::Sqlite => {
                let path = if config.database_url.is_empty() {
                    DEFAULT_SQLITE_PATH.to_string()
                } else {
                    config
                        .database_url
                        .trim_start_matches("sqlite://")
                        .to_string()
                };
                if path != ":memory:" {
                    if let Some(parent) = std::path::Path::new(&path).parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                }
                format!("sqlite://{}?mode=rwc", path)
            }
            _ => config.database_url.clone(),
        };

        let max_connections = match kind {
            DbKind::Sqlite => config.sqlite_max_connections,
            _ => 20,
        };
        let min_connections = match kind {
            DbKind::Sqlite => 0,
            _ => 1,
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .idle_timeout(Duration::from_secs(300))
            .acquire_timeout(Duration::from_secs(config.database_timeout_secs))
            .connect(&url)
            .await?;

        let db = Self {
            pool,
            kind,
            timeout: Duration::from_secs(config.database_timeout_secs),
        };

        if kind == DbKind::Sqlite {
            db.apply_sqlite_pragmas().await?;
        }
        db.migrate().await?;

        tracing::info!("Database ready (backend: {:?})", kind);
        Ok(db)
    }

    /// In-memory SQLite database for tests.
    #[cfg(test)]
    pub async fn connect_memory() -> DbResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self {
            pool,
            kind: DbKind::Sqlite,
            timeout: Duration::from_secs(30),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    /// Rewrite `?` placeholders to `$n` for Postgres.
    pub fn sql(&self, query: &str) -> String {
        if self.kind != DbKind::Postgres {
            return query.to_string();
        }
        let mut out = String::with_capacity(query.len() + 8);
        let mut n = 0;
        for ch in query.chars() {
            if ch == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Run a future under the query timeout.
    pub async fn timed<T, F>(&self, fut: F) -> DbResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DbError::Timeout(self.timeout)),
        }
    }

    async fn apply_sqlite_pragmas(&self) -> DbResult<()> {
        for pragma in [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=FULL",
            "PRAGMA cache_size=-65536",
            "PRAGMA mmap_size=268435456",
        ] {
            if let Err(e) = sqlx::query(pragma).execute(&self.pool).await {
                tracing::warn!("Pragma '{}' failed: {}", pragma, e);
            }
        }
        Ok(())
    }

    /// Probe whether a column exists (table-info on SQLite,
    /// information_schema elsewhere).
    pub async fn has_column(&self, table: &str, column: &str) -> DbResult<bool> {
        match self.kind {
            DbKind::Sqlite => {
                let rows: Vec<AnyRow> = self
                    .timed(
                        sqlx::query(&format!("PRAGMA table_info({})", table))
                            .fetch_all(&self.pool),
                    )
                    .await?;
                Ok(rows.iter().any(|row| {
                    row.try_get::<String, _>("name")
                        .map(|name| name == column)
                        .unwrap_or(false)
                }))
            }
            _ => {
                let sql = self.sql(
                    "SELECT COUNT(*) AS n FROM information_schema.columns \
                     WHERE table_name = ? AND column_name = ?",
                );
                let row = self
                    .timed(
                        sqlx::query(&sql)
                            .bind(table)
                            .bind(column)
                            .fetch_one(&self.pool),
                    )
                    .await?;
                let count: i64 = row.try_get("n").unwrap_or(0);
                Ok(count > 0)
            }
        }
    }

    async fn ensure_column(&self, table: &str, column: &str, ddl_type: &str) -> DbResult<()> {
        if !self.has_column(table, column).await? {
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ddl_type);
            sqlx::query(&sql).execute(&self.pool).await?;
            tracing::info!("Migration: added {}.{}", table, column);
        }
        Ok(())
    }

    async fn migrate(&self) -> DbResult<()> {
        let audit_id = match self.kind {
            DbKind::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            DbKind::Postgres => "id BIGSERIAL PRIMARY KEY",
            DbKind::MySql => "id BIGINT PRIMARY KEY AUTO_INCREMENT",
        };

        let tables = [
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                label TEXT,
                clientId TEXT,
                clientSecret TEXT,
                refreshToken TEXT,
                accessToken TEXT,
                expires_at TEXT,
                other TEXT,
                last_refresh_time TEXT,
                last_refresh_status TEXT,
                created_at TEXT,
                updated_at TEXT,
                enabled INTEGER DEFAULT 1,
                error_count INTEGER DEFAULT 0,
                success_count INTEGER DEFAULT 0,
                quota_exhausted INTEGER DEFAULT 0
            )"
            .to_string(),
            "CREATE TABLE IF NOT EXISTS secure_keys (
                key_id TEXT PRIMARY KEY,
                key_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                encrypted_key TEXT,
                lookup_hash TEXT,
                created_at TEXT,
                expires_at TEXT,
                last_used TEXT,
                usage_count INTEGER DEFAULT 0,
                max_uses INTEGER,
                allowed_ips TEXT,
                allowed_user_agents TEXT,
                allowed_accounts TEXT,
                default_account_id TEXT,
                rate_limit_per_minute INTEGER DEFAULT 300,
                status TEXT DEFAULT 'active',
                security_level TEXT DEFAULT 'production',
                metadata TEXT
            )"
            .to_string(),
            "CREATE TABLE IF NOT EXISTS auth_sessions (
                auth_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at BIGINT
            )"
            .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS audit_logs (
                {},
                timestamp TEXT,
                event_type TEXT,
                client_ip TEXT,
                details TEXT,
                user_agent TEXT
            )",
                audit_id
            ),
            "CREATE TABLE IF NOT EXISTS quota_stats (
                account_id TEXT PRIMARY KEY,
                month_key TEXT NOT NULL,
                request_count INTEGER DEFAULT 0,
                throttle_count INTEGER DEFAULT 0,
                last_throttle_time BIGINT,
                quota_status TEXT DEFAULT 'normal',
                created_at BIGINT,
                updated_at BIGINT
            )"
            .to_string(),
            "CREATE TABLE IF NOT EXISTS session_accounts (
                session_key TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                expires_at BIGINT NOT NULL,
                created_at BIGINT
            )"
            .to_string(),
        ];

        for ddl in &tables {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        // Columns added after the initial schema
        self.ensure_column("accounts", "quota_exhausted", "INTEGER DEFAULT 0")
            .await?;
        self.ensure_column("secure_keys", "encrypted_key", "TEXT").await?;
        self.ensure_column("secure_keys", "lookup_hash", "TEXT").await?;
        self.ensure_column("secure_keys", "allowed_accounts", "TEXT")
            .await?;
        self.ensure_column("secure_keys", "default_account_id", "TEXT")
            .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_accounts_enabled ON accounts(enabled)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_quota ON accounts(quota_exhausted)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_enabled_quota ON accounts(enabled, quota_exhausted)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_error_count ON accounts(error_count)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_created ON accounts(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_keys_status ON secure_keys(status)",
            "CREATE INDEX IF NOT EXISTS idx_keys_expires ON secure_keys(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_auth_sessions_created ON auth_sessions(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_logs(event_type)",
            "CREATE INDEX IF NOT EXISTS idx_quota_month ON quota_stats(month_key)",
            "CREATE INDEX IF NOT EXISTS idx_quota_status ON quota_stats(quota_status)",
            "CREATE INDEX IF NOT EXISTS idx_session_expires ON session_accounts(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_session_account ON session_accounts(account_id)",
        ];
        for ddl in indexes {
            if let Err(e) = sqlx::query(ddl).execute(&self.pool).await {
                tracing::debug!("Index creation skipped: {}", e);
            }
        }

        Ok(())
    }
}

/// Current UTC timestamp in the row format (`%Y-%m-%dT%H:%M:%S`).
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Current epoch seconds.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

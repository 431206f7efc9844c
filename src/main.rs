use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use qpool_rs::core::dedupe::RequestDeduper;
use qpool_rs::core::lock::DistributedLockManager;
use qpool_rs::dispatch::AppState;
use qpool_rs::http_client;
use qpool_rs::keys::crypto::{KeyCipher, MasterKey};
use qpool_rs::keys::manager::KeyManager;
use qpool_rs::model::arg::Args;
use qpool_rs::model::config::Config;
use qpool_rs::store::accounts::AccountStore;
use qpool_rs::store::audit::AuditLog;
use qpool_rs::store::auth_sessions::AuthSessionStore;
use qpool_rs::store::db::Database;
use qpool_rs::store::refresher::TokenRefresher;
use qpool_rs::store::sessions::SessionStore;
use qpool_rs::{anthropic, oauth, openai};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_env().unwrap_or_else(|e| {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    });
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    let config = Arc::new(config);

    // Master key must resolve before any key material is touched
    let master_key = MasterKey::resolve().unwrap_or_else(|e| {
        tracing::error!("Master key resolution failed: {}", e);
        std::process::exit(1);
    });
    let cipher = KeyCipher::new(master_key);

    let db = Database::connect(&config).await.unwrap_or_else(|e| {
        tracing::error!("Database initialization failed: {}", e);
        std::process::exit(1);
    });

    let proxy = config
        .http_proxy
        .as_ref()
        .map(|url| http_client::ProxyConfig::new(url));
    if let Some(proxy_url) = &config.http_proxy {
        tracing::info!("HTTP proxy configured: {}", proxy_url);
    }
    let client = http_client::init_shared_client(proxy.as_ref()).unwrap_or_else(|e| {
        tracing::error!("HTTP client initialization failed: {}", e);
        std::process::exit(1);
    });

    let locks = DistributedLockManager::new(
        &config.lock_dir,
        config.lock_timeout_secs,
        config.lock_stale_timeout_secs,
    )
    .unwrap_or_else(|e| {
        tracing::error!("Lock directory initialization failed: {}", e);
        std::process::exit(1);
    });

    let accounts = AccountStore::new(
        db.clone(),
        config.max_error_count,
        config.auto_disable_incomplete_accounts,
    );
    let sessions = SessionStore::new(db.clone());
    let auth_sessions = Arc::new(AuthSessionStore::new(
        db.clone(),
        config.max_auth_sessions,
        config.auth_session_ttl_secs,
    ));
    let audit = AuditLog::new(db.clone());
    let default_rate_limit = if config.security_strict {
        config.rate_limit_per_minute / 2
    } else {
        config.rate_limit_per_minute
    };
    let keys = Arc::new(KeyManager::new(
        cipher,
        db,
        config.security_strict,
        default_rate_limit,
    ));
    let refresher = TokenRefresher::new(
        accounts.clone(),
        config.clone(),
        locks.clone(),
        client.clone(),
    );
    let deduper = Arc::new(RequestDeduper::new(
        config.dedupe_window_ms,
        config.dedupe_max_keys,
    ));

    match keys.load_keys_from_db().await {
        Ok(count) => tracing::info!("API keys loaded: {}", count),
        Err(e) => tracing::warn!("API key preload failed: {}", e),
    }

    let state = AppState {
        config: config.clone(),
        accounts,
        sessions,
        auth_sessions,
        keys,
        refresher: refresher.clone(),
        deduper,
        audit,
        client,
    };

    spawn_background_tasks(&state, refresher);

    let app = anthropic::router::create_router(state.clone())
        .merge(openai::router::create_router(state.clone()))
        .nest("/v0/auth", oauth::router::create_router(state.clone()))
        .fallback(fallback_handler);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Starting gateway: {}", addr);
    tracing::info!("Available APIs:");
    tracing::info!("  POST /v1/chat/completions");
    tracing::info!("  POST /v1/messages");
    tracing::info!("  POST /v1/messages/count_tokens");
    tracing::info!("  GET  /v1/models");
    if config.admin_api_key.is_some() {
        tracing::info!("Auth flow enabled:");
        tracing::info!("  POST /v0/auth/start");
        tracing::info!("  GET  /v0/auth/status/{{auth_id}}");
        tracing::info!("  GET  /v0/auth/claim/{{auth_id}}");
    }

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

/// Safety net for unmatched routes; every response carries a request id
/// so failures can be correlated in logs.
async fn fallback_handler(uri: axum::http::Uri) -> axum::response::Response {
    use axum::response::IntoResponse;

    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::debug!("Unmatched route {} (request_id={})", uri, request_id);
    (
        axum::http::StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({
            "error": {
                "message": "Not found",
                "type": "not_found_error",
                "code": "route_not_found",
                "request_id": request_id
            }
        })),
    )
        .into_response()
}

/// Background maintenance: token refresh, session-binding cleanup,
/// auth-session reaping. Loop errors never stop a loop.
fn spawn_background_tasks(state: &AppState, refresher: TokenRefresher) {
    tokio::spawn(refresher.run_scheduled_refresh_loop());

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(600)).await;
            match sessions.cleanup_expired_sessions().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!("Expired session bindings removed: {}", removed),
                Err(e) => tracing::warn!("Session cleanup failed: {}", e),
            }
        }
    });

    let auth_sessions = state.auth_sessions.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            match auth_sessions.reap_old_sessions().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!("Old auth sessions reaped: {}", removed),
                Err(e) => tracing::warn!("Auth session reaping failed: {}", e),
            }
        }
    });
}

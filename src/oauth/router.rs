//! Device-code auth router
//!
//! Admin-key gated: these endpoints mint pool accounts.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use crate::common::auth::constant_time_eq;
use crate::dispatch::AppState;

use super::handler;
use super::types::AuthStartBody;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "Management endpoints not configured"})),
        )
            .into_response());
    };

    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Admin authentication required"})),
        )
            .into_response());
    }
    if !constant_time_eq(provided, expected) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"detail": "Authentication failed"})),
        )
            .into_response());
    }
    Ok(())
}

async fn auth_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AuthStartBody>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match handler::auth_start(&state, &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(message) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"detail": message})),
        )
            .into_response(),
    }
}

async fn auth_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(auth_id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match handler::auth_status(&state, &auth_id).await {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Auth session not found"})),
        )
            .into_response(),
    }
}

async fn auth_claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(auth_id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match handler::auth_claim(&state, &auth_id).await {
        Ok(Some(account_id)) => {
            (StatusCode::OK, Json(json!({"accountId": account_id}))).into_response()
        }
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(json!({"detail": "Authentication not completed"})),
        )
            .into_response(),
        Err(message) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": message})),
        )
            .into_response(),
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(auth_start))
        .route("/status/{auth_id}", get(auth_status))
        .route("/claim/{auth_id}", get(auth_claim))
        .with_state(state)
}

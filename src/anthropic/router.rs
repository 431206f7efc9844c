//! Anthropic API router

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::dispatch::AppState;

use super::handlers;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::count_tokens_endpoint),
        )
        .route("/v1/models", get(handlers::list_models))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

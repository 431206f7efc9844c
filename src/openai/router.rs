//! OpenAI API router

use axum::Router;
use axum::routing::post;
use tower_http::cors::CorsLayer;

use crate::dispatch::AppState;

use super::handlers;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router as AxumRouter;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full HTTP surface: OpenAI-compatible routes, model listing,
/// health/version, Prometheus exposition, and the sleep/wake control trio.
pub fn build_router(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/audio/transcriptions", post(handlers::transcriptions))
        .route("/v1/models", get(handlers::list_models))
        .route("/version", get(handlers::version))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/sleep", post(handlers::sleep))
        .route("/wake_up", post(handlers::wake_up))
        .route("/is_sleeping", get(handlers::is_sleeping))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

use axum::{extract::DefaultBodyLimit, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{embeddings, state::AppState};

/// Full HTTP surface with shared state attached.
pub fn app(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .merge(embeddings::router())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

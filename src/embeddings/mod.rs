use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub mod dto;
pub mod handler;

use handler::{embed_handler, health_handler};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/embed", post(embed_handler))
        .route("/health", get(health_handler))
}

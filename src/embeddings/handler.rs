use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use super::dto::{EmbedRequest, EmbedResponse, HealthResponse};
use crate::inference::TextEncoder;
use crate::state::AppState;

pub async fn embed_handler(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, (StatusCode, String)> {
    run_embed_job(state.encoder.clone(), req).await
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        model: state.encoder.model_name().to_string(),
    })
}

async fn run_embed_job(
    encoder: Arc<dyn TextEncoder>,
    req: EmbedRequest,
) -> Result<Json<EmbedResponse>, (StatusCode, String)> {
    let count = req.texts.len();
    let started = Instant::now();

    // inference is compute-bound; keep it off the async workers
    let embeddings = tokio::task::spawn_blocking(move || encoder.encode_batch(&req.texts))
        .await
        .map_err(|err| {
            error!(?err, "embedding task panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?
        .map_err(|err| {
            error!(error = %err, texts = count, "embedding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;

    debug!(
        texts = count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "embed request served"
    );

    Ok(Json(EmbedResponse { embeddings }))
}

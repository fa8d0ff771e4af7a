use anyhow::{anyhow, bail, Result};
use std::time::Duration;
use tracing::error;

use crate::embeddings::dto::{EmbedRequest, EmbedResponse, HealthResponse};

pub const DEFAULT_TIMEOUT_MS: u64 = 8000;

/// Caller side of `POST /embed`, for services that consume the embedder over HTTP.
///
/// Configure with `EMBEDDING_SERVICE_URL` and `EMBEDDING_TIMEOUT_MS`. A missing URL
/// is only reported when a request is made, so callers can construct the client
/// unconditionally at startup.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn from_env() -> Self {
        let base_url = dotenvy::var("EMBEDDING_SERVICE_URL").unwrap_or_default();
        let timeout_ms = dotenvy::var("EMBEDDING_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Self::new(&base_url, Duration::from_millis(timeout_ms))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_many(&[text.to_string()]).await?;
        Ok(embeddings.swap_remove(0))
    }

    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.ensure_configured()?;

        let body = EmbedRequest {
            texts: texts.to_vec(),
        };
        let res = self
            .client
            .post(format!("{}/embed", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            bail!("Embedding service error: {} {}", status.as_u16(), body);
        }

        let payload: EmbedResponse = res.json().await.map_err(request_error)?;
        if payload.embeddings.is_empty() {
            bail!("Embedding service returned no vectors");
        }

        Ok(payload.embeddings)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.ensure_configured()?;

        let res = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(request_error)?;

        let status = res.status();
        if !status.is_success() {
            bail!("Embedding service health check failed: {}", status.as_u16());
        }

        res.json().await.map_err(request_error)
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("Embedding service URL is not set");
        }
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        return anyhow!("Embedding service request timed out");
    }
    error!(error = %err, "embedding service request failed");
    anyhow::Error::new(err).context("Embedding service request failed")
}

use anyhow::{anyhow, Result};
use std::net::SocketAddr;

pub const DEFAULT_MODEL: &str = "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2";
pub const DEFAULT_DEVICE: &str = "cpu";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Everything the service reads from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Hub repo id, or a local directory holding the model files.
    pub model: String,
    pub device: String,
    pub revision: String,
    pub batch_size: usize,
    pub max_seq_len: Option<usize>,
    pub bind_addr: SocketAddr,
    pub max_body_bytes: usize,
}

impl ServiceConfig {
    /// Reads the process environment, honoring a `.env` file when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let batch_size = match get("EMBEDDING_BATCH_SIZE") {
            Some(raw) => parse_usize("EMBEDDING_BATCH_SIZE", &raw)?,
            None => DEFAULT_BATCH_SIZE,
        };
        if batch_size == 0 {
            return Err(anyhow!("EMBEDDING_BATCH_SIZE must be at least 1"));
        }

        let max_seq_len = get("EMBEDDING_MAX_SEQ_LEN")
            .map(|raw| parse_usize("EMBEDDING_MAX_SEQ_LEN", &raw))
            .transpose()?;
        if max_seq_len == Some(0) {
            return Err(anyhow!("EMBEDDING_MAX_SEQ_LEN must be at least 1"));
        }

        let bind_raw = get("EMBEDDING_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into());
        let bind_addr = bind_raw
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid EMBEDDING_BIND_ADDR '{bind_raw}': {e}"))?;

        let max_body_bytes = match get("EMBEDDING_MAX_BODY_BYTES") {
            Some(raw) => parse_usize("EMBEDDING_MAX_BODY_BYTES", &raw)?,
            None => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(Self {
            model: get("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            device: get("EMBEDDING_DEVICE").unwrap_or_else(|| DEFAULT_DEVICE.into()),
            revision: get("EMBEDDING_REVISION").unwrap_or_else(|| DEFAULT_REVISION.into()),
            batch_size,
            max_seq_len,
            bind_addr,
            max_body_bytes,
        })
    }
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| anyhow!("invalid {key} '{raw}': {e}"))
}

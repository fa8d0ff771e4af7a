use anyhow::{anyhow, Result};
use candle::{DType, Device, Tensor};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use std::time::Instant;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

use super::device::build_device;
use super::pooling::{normalize_l2, PoolingMode};
use super::snapshot::{self, PoolingConfig, SentenceBertConfig};
use super::TextEncoder;
use crate::config::ServiceConfig;

/// The two config.json fields the encoder needs outside of the bert config itself.
#[derive(Debug, Deserialize)]
struct EncoderDims {
    hidden_size: usize,
    max_position_embeddings: usize,
}

/// A BERT-family sentence-transformer loaded once and shared read-only.
pub struct SentenceEncoder {
    name: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    pooling: PoolingMode,
    lowercase: bool,
    batch_size: usize,
    dim: usize,
}

impl SentenceEncoder {
    pub fn load(cfg: &ServiceConfig) -> Result<Self> {
        let started = Instant::now();
        let files = snapshot::resolve(&cfg.model, &cfg.revision)?;
        let device = build_device(&cfg.device)?;

        snapshot::check_architecture(&files)?;
        let bert_config: BertConfig = snapshot::read_json(&files.config)?;
        let dims: EncoderDims = snapshot::read_json(&files.config)?;
        let sbert: SentenceBertConfig = files
            .sentence_bert_config
            .as_deref()
            .map(snapshot::read_json)
            .transpose()?
            .unwrap_or_default();
        let pooling = match files.pooling_config.as_deref() {
            Some(path) => {
                let raw: PoolingConfig = snapshot::read_json(path)?;
                PoolingMode::from_config(&raw)
                    .map_err(|e| anyhow!("{}: {e}", path.display()))?
            }
            None => PoolingMode::default(),
        };

        let max_seq_len = cfg
            .max_seq_len
            .or(sbert.max_seq_length)
            .unwrap_or(dims.max_position_embeddings)
            .min(dims.max_position_embeddings);

        let tokenizer = load_tokenizer(&files.tokenizer, max_seq_len)?;

        let vb = snapshot::build_var_builder(&files.weights, DType::F32, &device)?;
        let model = BertModel::load(vb, &bert_config)?;

        info!(
            model = %cfg.model,
            device = ?device,
            dim = dims.hidden_size,
            max_seq_len,
            pooling = ?pooling,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sentence encoder ready"
        );

        Ok(Self {
            name: cfg.model.clone(),
            model,
            tokenizer,
            device,
            pooling,
            lowercase: sbert.do_lower_case,
            batch_size: cfg.batch_size.max(1),
            dim: dims.hidden_size,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Tokenizes, runs the model and pools one padded batch.
    fn encode_chunk(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| anyhow!("tokenizer encode error: {e}"))?;

        let ids = encodings
            .iter()
            .map(|enc| Tensor::new(enc.get_ids(), &self.device))
            .collect::<candle::Result<Vec<_>>>()?;
        let masks = encodings
            .iter()
            .map(|enc| Tensor::new(enc.get_attention_mask(), &self.device))
            .collect::<candle::Result<Vec<_>>>()?;

        let input_ids = Tensor::stack(&ids, 0)?;
        let attention_mask = Tensor::stack(&masks, 0)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = self.pooling.pool(&hidden, &attention_mask)?;
        let normalized = normalize_l2(&pooled)?;

        Ok(normalized.to_vec2::<f32>()?)
    }
}

impl TextEncoder for SentenceEncoder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let order = length_sorted_order(texts);
        let mut out = vec![Vec::new(); texts.len()];

        for chunk in order.chunks(self.batch_size) {
            let batch = chunk
                .iter()
                .map(|&idx| {
                    if self.lowercase {
                        texts[idx].to_lowercase()
                    } else {
                        texts[idx].clone()
                    }
                })
                .collect();
            let vectors = self.encode_chunk(batch)?;
            if vectors.len() != chunk.len() {
                return Err(anyhow!(
                    "model returned {} vectors for {} inputs",
                    vectors.len(),
                    chunk.len()
                ));
            }
            for (&idx, vector) in chunk.iter().zip(vectors) {
                out[idx] = vector;
            }
        }

        debug!(
            texts = texts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "encoded batch"
        );
        Ok(out)
    }
}

fn load_tokenizer(path: &std::path::Path, max_seq_len: usize) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", path.display()))?;

    let pad_id = pad_token_id(&tokenizer);
    let pad_token = tokenizer
        .id_to_token(pad_id)
        .unwrap_or_else(|| "[PAD]".to_string());
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        pad_id,
        pad_token,
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_seq_len,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("invalid truncation for {}: {e}", path.display()))?;

    Ok(tokenizer)
}

fn pad_token_id(tokenizer: &Tokenizer) -> u32 {
    tokenizer
        .get_padding()
        .map(|params| params.pad_id)
        .or_else(|| tokenizer.token_to_id("[PAD]"))
        .or_else(|| tokenizer.token_to_id("<pad>"))
        .unwrap_or(0)
}

/// Indices of `texts`, longest first, so each chunk pads to a similar length.
/// Ties keep input order.
fn length_sorted_order(texts: &[String]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..texts.len()).collect();
    order.sort_by_key(|&idx| std::cmp::Reverse(texts[idx].chars().count()));
    order
}

pub mod device;
pub mod pooling;
pub mod sentence_encoder;
pub mod snapshot;

use anyhow::Result;

pub use sentence_encoder::SentenceEncoder;

/// Anything that turns a list of texts into unit-length vectors, index-aligned
/// with the input. Implementations are immutable after construction.
pub trait TextEncoder: Send + Sync {
    fn model_name(&self) -> &str;

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

use anyhow::{bail, Result};
use candle::{DType, Tensor};

use super::snapshot::PoolingConfig;

/// Smallest divisor used when scaling to unit length, same as torch's `F.normalize`.
const NORM_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolingMode {
    Cls,
    #[default]
    Mean,
    Max,
    MeanSqrtLen,
}

impl PoolingMode {
    /// Exactly one supported flag, or none for mean. Weighted-mean and last-token
    /// pooling, and concatenated modes, are refused.
    pub fn from_config(cfg: &PoolingConfig) -> Result<Self> {
        if cfg.pooling_mode_weightedmean_tokens {
            bail!("unsupported pooling mode 'pooling_mode_weightedmean_tokens'");
        }
        if cfg.pooling_mode_lasttoken {
            bail!("unsupported pooling mode 'pooling_mode_lasttoken'");
        }

        let enabled: Vec<PoolingMode> = [
            (cfg.pooling_mode_cls_token, PoolingMode::Cls),
            (cfg.pooling_mode_mean_tokens, PoolingMode::Mean),
            (cfg.pooling_mode_max_tokens, PoolingMode::Max),
            (cfg.pooling_mode_mean_sqrt_len_tokens, PoolingMode::MeanSqrtLen),
        ]
        .into_iter()
        .filter_map(|(on, mode)| on.then_some(mode))
        .collect();

        match enabled.as_slice() {
            [] => Ok(PoolingMode::Mean),
            [mode] => Ok(*mode),
            many => bail!("concatenated pooling modes {many:?} are not supported"),
        }
    }

    /// `hidden` is `[batch, seq, dim]`, `attention_mask` is `[batch, seq]`.
    /// Returns `[batch, dim]`. Padded positions never contribute.
    pub fn pool(self, hidden: &Tensor, attention_mask: &Tensor) -> candle::Result<Tensor> {
        let hidden = hidden.to_dtype(DType::F32)?;
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;

        match self {
            PoolingMode::Cls => hidden.narrow(1, 0, 1)?.squeeze(1),
            PoolingMode::Mean => {
                let (sum, count) = masked_sum(&hidden, &mask)?;
                sum.broadcast_div(&count)
            }
            PoolingMode::MeanSqrtLen => {
                let (sum, count) = masked_sum(&hidden, &mask)?;
                sum.broadcast_div(&count.sqrt()?)
            }
            PoolingMode::Max => {
                // 0 for real tokens, -1e9 for padding
                let penalty = mask.affine(1e9, -1e9)?;
                hidden.broadcast_add(&penalty)?.max(1)
            }
        }
    }
}

fn masked_sum(hidden: &Tensor, mask: &Tensor) -> candle::Result<(Tensor, Tensor)> {
    let sum = hidden.broadcast_mul(mask)?.sum(1)?;
    let count = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    Ok((sum, count))
}

/// Scales each row of a `[batch, dim]` tensor to unit L2 norm.
pub fn normalize_l2(embeddings: &Tensor) -> candle::Result<Tensor> {
    let norm = embeddings
        .sqr()?
        .sum_keepdim(1)?
        .sqrt()?
        .clamp(NORM_EPS, f64::MAX)?;
    embeddings.broadcast_div(&norm)
}

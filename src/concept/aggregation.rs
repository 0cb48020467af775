//! Localized token aggregation
//!
//! Pools a variable-length token sequence into K concept slots. For every
//! (sample, concept) pair independently:
//!
//! 1. padded positions get score `-inf`
//! 2. non-positive scores get `-inf` (only positive affinity is eligible)
//! 3. scores below the k-th largest get `-inf`; selection is by threshold,
//!    so ties at the k-th value are all kept
//! 4. pseudo label = 1 where the surviving score is > 0
//! 5. softmax over the sequence axis; an all-`-inf` column yields NaN,
//!    which is replaced by 0 so that concept receives nothing
//! 6. slot = weighted sum of token features
//!
//! Scores are detached first: routing is a constant of the forward pass and
//! gradients only flow through the token values.

use candle_core::{DType, Tensor};
use tracing::{debug, Level};

use crate::primitives::{expect_dims, masked_fill, nan_to_zero, softmax};
use crate::{HashCoreError, Result};

/// Result of one aggregation pass
#[derive(Debug, Clone)]
pub struct AggregationOutput {
    /// Concept slots `[K, N, D]`
    pub slots: Tensor,
    /// Top-k selection mask `[L, N, K]`, 1.0 = selected
    pub pseudo_label: Tensor,
    /// Aggregation weights `[L, N, K]`; each (sample, concept) column sums
    /// to 1 or is all zero
    pub weights: Tensor,
}

/// Top-k sparse soft assignment of tokens to concept slots
#[derive(Debug, Clone, Copy)]
pub struct LocalizedTokenAggregation {
    top_k: usize,
}

impl LocalizedTokenAggregation {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Aggregate `tokens: [L, N, D]` into `[K, N, D]` slots using
    /// `scores: [L, N, K]`.
    ///
    /// `padding_mask: [N, L]`, nonzero marks a padded token.
    pub fn forward(
        &self,
        tokens: &Tensor,
        scores: &Tensor,
        padding_mask: Option<&Tensor>,
    ) -> Result<AggregationOutput> {
        let (seq_len, batch, _dim) = tokens.dims3().map_err(|e| {
            HashCoreError::Shape(format!("aggregation tokens must be LND: {}", e))
        })?;
        expect_dims(scores, "concept scores", "LNK", &[Some(seq_len), Some(batch), None])?;
        if let Some(mask) = padding_mask {
            expect_dims(mask, "padding mask", "NL", &[Some(batch), Some(seq_len)])?;
        }
        if self.top_k == 0 || self.top_k > seq_len {
            return Err(HashCoreError::Shape(format!(
                "top_k ({}) must be in 1..={} (sequence length)",
                self.top_k, seq_len
            )));
        }

        let mut sim = scores.detach();

        if let Some(mask) = padding_mask {
            let pad = padding_to_lnk(mask)?;
            sim = masked_fill(&sim, &pad, f32::NEG_INFINITY)?;
        }

        let zeros = sim
            .zeros_like()
            .map_err(|e| HashCoreError::Tensor(format!("aggregation zeros failed: {}", e)))?;
        let non_positive = sim
            .le(&zeros)
            .map_err(|e| HashCoreError::Tensor(format!("aggregation compare failed: {}", e)))?;
        let sim = masked_fill(&sim, &non_positive, f32::NEG_INFINITY)?;

        // LNK -> NKL so the sequence axis is last for sorting and softmax
        let sim = sim
            .permute((1, 2, 0))
            .map_err(|e| HashCoreError::Tensor(format!("aggregation permute failed: {}", e)))?
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("aggregation contiguous failed: {}", e)))?;

        let thresholded = self.keep_top_k(&sim)?;

        let zeros = thresholded
            .zeros_like()
            .map_err(|e| HashCoreError::Tensor(format!("aggregation zeros failed: {}", e)))?;
        let pseudo_label = thresholded
            .gt(&zeros)
            .map_err(|e| HashCoreError::Tensor(format!("pseudo label compare failed: {}", e)))?
            .to_dtype(DType::F32)
            .map_err(|e| HashCoreError::Tensor(format!("pseudo label cast failed: {}", e)))?;

        let weights = nan_to_zero(&softmax(&thresholded, 2)?)?;

        if tracing::enabled!(Level::DEBUG) {
            log_empty_concepts(&pseudo_label)?;
        }

        // [N, K, L] @ [N, L, D] -> [N, K, D]
        let values = tokens
            .transpose(0, 1)
            .map_err(|e| HashCoreError::Tensor(format!("aggregation token transpose failed: {}", e)))?
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("aggregation contiguous failed: {}", e)))?;
        let slots = weights
            .matmul(&values)
            .map_err(|e| HashCoreError::Tensor(format!("aggregation matmul failed: {}", e)))?
            .transpose(0, 1)
            .map_err(|e| HashCoreError::Tensor(format!("aggregation slot transpose failed: {}", e)))?
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("aggregation contiguous failed: {}", e)))?;

        Ok(AggregationOutput {
            slots,
            pseudo_label: nkl_to_lnk(&pseudo_label)?,
            weights: nkl_to_lnk(&weights)?,
        })
    }

    /// Keep entries >= the k-th largest value along the last axis, `-inf` elsewhere.
    fn keep_top_k(&self, sim: &Tensor) -> Result<Tensor> {
        let (sorted, _) = sim
            .sort_last_dim(false)
            .map_err(|e| HashCoreError::Tensor(format!("top-k sort failed: {}", e)))?;
        let kth = sorted
            .narrow(2, self.top_k - 1, 1)
            .map_err(|e| HashCoreError::Tensor(format!("top-k narrow failed: {}", e)))?;

        let selected = sim
            .broadcast_ge(&kth)
            .map_err(|e| HashCoreError::Tensor(format!("top-k compare failed: {}", e)))?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, sim.shape(), sim.device())
            .map_err(|e| HashCoreError::Tensor(format!("top-k fill failed: {}", e)))?;

        selected
            .where_cond(sim, &neg_inf)
            .map_err(|e| HashCoreError::Tensor(format!("top-k where failed: {}", e)))
    }
}

/// `[N, L]` padding mask (any dtype, nonzero = padded) -> `[L, N, 1]` u8
fn padding_to_lnk(mask: &Tensor) -> Result<Tensor> {
    let mask = mask
        .to_dtype(DType::F32)
        .map_err(|e| HashCoreError::Tensor(format!("padding mask cast failed: {}", e)))?;
    let zeros = mask
        .zeros_like()
        .map_err(|e| HashCoreError::Tensor(format!("padding mask zeros failed: {}", e)))?;
    mask.ne(&zeros)
        .map_err(|e| HashCoreError::Tensor(format!("padding mask compare failed: {}", e)))?
        .t()
        .map_err(|e| HashCoreError::Tensor(format!("padding mask transpose failed: {}", e)))?
        .unsqueeze(2)
        .map_err(|e| HashCoreError::Tensor(format!("padding mask unsqueeze failed: {}", e)))
}

fn nkl_to_lnk(x: &Tensor) -> Result<Tensor> {
    x.permute((2, 0, 1))
        .map_err(|e| HashCoreError::Tensor(format!("NKL -> LNK permute failed: {}", e)))?
        .contiguous()
        .map_err(|e| HashCoreError::Tensor(format!("NKL -> LNK contiguous failed: {}", e)))
}

fn log_empty_concepts(pseudo_label_nkl: &Tensor) -> Result<()> {
    let per_column = pseudo_label_nkl
        .sum(2)
        .map_err(|e| HashCoreError::Tensor(format!("empty concept count failed: {}", e)))?
        .flatten_all()
        .map_err(|e| HashCoreError::Tensor(format!("empty concept flatten failed: {}", e)))?
        .to_vec1::<f32>()
        .map_err(|e| HashCoreError::Tensor(format!("empty concept readback failed: {}", e)))?;
    let empty = per_column.iter().filter(|c| **c == 0.0).count();
    debug!(
        empty,
        total = per_column.len(),
        "(sample, concept) columns without eligible tokens"
    );
    Ok(())
}

//! Local concept transformer
//!
//! Slot path of one modality: aggregate tokens into K concept slots, add the
//! slot position signal, contextualize the slots with a short transformer and
//! hash each slot to one bit.

use candle_core::{Device, Tensor, Var};
use tracing::debug;

use super::{BitwiseHashing, LocalizedTokenAggregation, PositionalEncoding};
use crate::config::HashConfig;
use crate::layers::{join_name, Parameterized, SlotTransformer};
use crate::Result;

/// Output of [`LocalConceptTransformer::forward`]
#[derive(Debug, Clone)]
pub struct LocalConceptOutput {
    /// Token-level hash code `[N, K]` in (-1, 1)
    pub hash: Tensor,
    /// Top-k selection mask `[L, N, K]`
    pub pseudo_label: Tensor,
    /// Transformed slot features `[K, N, D]`, before hashing
    pub slots: Tensor,
}

/// Aggregation → position → slot transformer → per-bit hashing
#[derive(Debug, Clone)]
pub struct LocalConceptTransformer {
    lta: LocalizedTokenAggregation,
    position: PositionalEncoding,
    transformer: SlotTransformer,
    hashing: BitwiseHashing,
}

impl LocalConceptTransformer {
    pub fn new(
        dim: usize,
        k_bits: usize,
        transformer_layers: usize,
        heads: usize,
        top_k: usize,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            lta: LocalizedTokenAggregation::new(top_k),
            // One position per concept slot; no dropout on the slot signal
            position: PositionalEncoding::new(dim, k_bits, 0.0, device)?,
            transformer: SlotTransformer::new(dim, transformer_layers, heads, device)?,
            hashing: BitwiseHashing::new(dim, k_bits, device)?,
        })
    }

    pub fn from_config(config: &HashConfig, device: &Device) -> Result<Self> {
        Self::new(
            config.embed_dim,
            config.k_bits,
            config.transformer_layers,
            config.heads(),
            config.top_k_label,
            device,
        )
    }

    pub fn k_bits(&self) -> usize {
        self.hashing.k_bits()
    }

    pub fn top_k(&self) -> usize {
        self.lta.top_k()
    }

    pub fn transformer(&self) -> &SlotTransformer {
        &self.transformer
    }

    pub fn hashing(&self) -> &BitwiseHashing {
        &self.hashing
    }

    /// `tokens: [L, N, D]`, `scores: [L, N, K]`, `padding_mask: [N, L]`
    pub fn forward(
        &self,
        tokens: &Tensor,
        scores: &Tensor,
        padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<LocalConceptOutput> {
        debug!(
            tokens = ?tokens.dims(),
            masked = padding_mask.is_some(),
            "local concept transform"
        );

        let agg = self.lta.forward(tokens, scores, padding_mask)?;
        let slots = self.position.forward(&agg.slots, train)?;
        let (slots, _) = self.transformer.forward(&slots)?;
        let hash = self.hashing.forward(&slots)?;

        Ok(LocalConceptOutput {
            hash,
            pseudo_label: agg.pseudo_label,
            slots,
        })
    }
}

impl Parameterized for LocalConceptTransformer {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.transformer
            .collect_vars(&join_name(prefix, "transformer"), out);
        self.hashing.collect_vars(&join_name(prefix, "hashing"), out);
    }
}

//! Two-branch cross-modal hashing model
//!
//! Image and text each get a [`ModalityBranch`]. Both branches hold the same
//! [`GlobalConceptLearner`] through an `Arc`, so the two modalities project
//! into one concept space; slot transformers, hashing heads and concept
//! projections are per modality.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor, Var};
use tracing::{debug, info};

use crate::concept::{GlobalConceptLearner, LocalConceptTransformer};
use crate::config::HashConfig;
use crate::layers::{join_name, Linear, Parameterized};
use crate::primitives::{expect_dims, l2_normalize};
use crate::{HashCoreError, Result};

/// Per-modality results of a forward pass
#[derive(Debug, Clone)]
pub struct ModalityOutput {
    /// Pooled hash code `[N, K]` in (-1, 1)
    pub pooled_hash: Tensor,
    /// Enriched pooled feature `[N, D]`, unit L2 norm
    pub pooled_features: Tensor,
    /// Token-level hash code `[N, K]` in (-1, 1)
    pub token_hash: Tensor,
    /// Projected slot features `[K, N, D]`, unit L2 norm
    pub token_features: Tensor,
    /// Top-k selection mask `[L, N, K]`
    pub pseudo_label: Tensor,
}

/// Results of [`HashingModel::forward`] and the single-modality entry points
#[derive(Debug, Clone, Default)]
pub struct HashOutput {
    pub image: Option<ModalityOutput>,
    pub text: Option<ModalityOutput>,
}

impl HashOutput {
    /// Flatten into the named tensors consumed by alignment losses.
    ///
    /// Keys: `img_cls_hash`, `res_img_cls`, `img_tokens_hash`,
    /// `trans_tokens_i` and their text counterparts `txt_cls_hash`,
    /// `res_txt_cls`, `txt_tokens_hash`, `trans_tokens_t`. Missing
    /// modalities contribute no keys.
    pub fn into_map(self) -> HashMap<String, Tensor> {
        let mut map = HashMap::new();
        if let Some(img) = self.image {
            map.insert("img_cls_hash".to_string(), img.pooled_hash);
            map.insert("res_img_cls".to_string(), img.pooled_features);
            map.insert("img_tokens_hash".to_string(), img.token_hash);
            map.insert("trans_tokens_i".to_string(), img.token_features);
        }
        if let Some(txt) = self.text {
            map.insert("txt_cls_hash".to_string(), txt.pooled_hash);
            map.insert("res_txt_cls".to_string(), txt.pooled_features);
            map.insert("txt_tokens_hash".to_string(), txt.token_hash);
            map.insert("trans_tokens_t".to_string(), txt.token_features);
        }
        map
    }
}

/// Sub-pipeline of one modality
#[derive(Debug, Clone)]
pub struct ModalityBranch {
    concept: Arc<GlobalConceptLearner>,
    local: LocalConceptTransformer,
    concept_proj: Linear,
}

impl ModalityBranch {
    pub fn new(
        concept: Arc<GlobalConceptLearner>,
        config: &HashConfig,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            concept,
            local: LocalConceptTransformer::from_config(config, device)?,
            concept_proj: Linear::new(config.embed_dim, config.embed_dim, true, device)?,
        })
    }

    /// The concept learner shared with the other modality
    pub fn concept(&self) -> &Arc<GlobalConceptLearner> {
        &self.concept
    }

    pub fn local(&self) -> &LocalConceptTransformer {
        &self.local
    }

    /// `tokens: [L, N, D]`, `pooled: [N, D]`, `padding_mask: [N, L]`
    pub fn forward(
        &self,
        tokens: &Tensor,
        pooled: &Tensor,
        padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<ModalityOutput> {
        let dim = self.concept_proj.in_dim();
        let (seq_len, batch, _) = tokens.dims3().map_err(|e| {
            HashCoreError::Shape(format!("tokens must be LND: {}", e))
        })?;
        expect_dims(tokens, "tokens", "LND", &[Some(seq_len), Some(batch), Some(dim)])?;
        expect_dims(pooled, "pooled embedding", "ND", &[Some(batch), Some(dim)])?;
        if let Some(mask) = padding_mask {
            expect_dims(mask, "padding mask", "NL", &[Some(batch), Some(seq_len)])?;
        }

        let (pooled_features, pooled_hash) = self.concept.forward(pooled, train)?;

        // Token scores from the same projection; the aggregator detaches them
        let (_, token_scores) = self.concept.forward(tokens, train)?;
        let local = self.local.forward(tokens, &token_scores, padding_mask, train)?;

        let token_features = l2_normalize(&self.concept_proj.forward(&local.slots)?)?;

        Ok(ModalityOutput {
            pooled_hash,
            pooled_features: l2_normalize(&pooled_features)?,
            token_hash: local.hash,
            token_features,
            pseudo_label: local.pseudo_label,
        })
    }

    fn collect_own_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.local.collect_vars(&join_name(prefix, "lct"), out);
        self.concept_proj
            .collect_vars(&join_name(prefix, "concept_proj"), out);
    }
}

impl Parameterized for ModalityBranch {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.concept.collect_vars(&join_name(prefix, "gcl"), out);
        self.collect_own_vars(prefix, out);
    }
}

/// Full image/text hashing model
#[derive(Debug, Clone)]
pub struct HashingModel {
    config: HashConfig,
    image: ModalityBranch,
    text: ModalityBranch,
}

impl HashingModel {
    pub fn new(config: &HashConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let concept = Arc::new(GlobalConceptLearner::from_config(config, device)?);
        let image = ModalityBranch::new(Arc::clone(&concept), config, device)?;
        let text = ModalityBranch::new(concept, config, device)?;

        let model = Self {
            config: config.clone(),
            image,
            text,
        };

        info!(
            embed_dim = config.embed_dim,
            k_bits = config.k_bits,
            top_k = config.top_k_label,
            transformer_layers = config.transformer_layers,
            heads = config.heads(),
            params = model.param_count(),
            "hashing model ready"
        );
        Ok(model)
    }

    pub fn config(&self) -> &HashConfig {
        &self.config
    }

    pub fn image(&self) -> &ModalityBranch {
        &self.image
    }

    pub fn text(&self) -> &ModalityBranch {
        &self.text
    }

    /// The concept learner both branches share
    pub fn concept(&self) -> &Arc<GlobalConceptLearner> {
        self.image.concept()
    }

    /// Run both modalities.
    ///
    /// `img_tokens`/`txt_tokens`: `[L, N, D]` (lengths may differ),
    /// `img_cls`/`txt_eos`: `[N, D]`, `key_padding_mask`: text padding `[N, L_txt]`.
    pub fn forward(
        &self,
        img_tokens: &Tensor,
        txt_tokens: &Tensor,
        img_cls: &Tensor,
        txt_eos: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<HashOutput> {
        debug!(
            img_tokens = ?img_tokens.dims(),
            txt_tokens = ?txt_tokens.dims(),
            train,
            "hashing forward"
        );

        if img_cls.dims().first() != txt_eos.dims().first() {
            return Err(HashCoreError::Shape(format!(
                "image and text batch sizes differ: {:?} vs {:?}",
                img_cls.dims(),
                txt_eos.dims()
            )));
        }

        Ok(HashOutput {
            image: Some(self.image.forward(img_tokens, img_cls, None, train)?),
            text: Some(self.text.forward(txt_tokens, txt_eos, key_padding_mask, train)?),
        })
    }

    /// Image-only inference: `img_tokens: [L, N, D]`, `img_cls: [N, D]`
    pub fn forward_image(
        &self,
        img_tokens: &Tensor,
        img_cls: &Tensor,
        train: bool,
    ) -> Result<HashOutput> {
        debug!(img_tokens = ?img_tokens.dims(), "image forward");
        Ok(HashOutput {
            image: Some(self.image.forward(img_tokens, img_cls, None, train)?),
            text: None,
        })
    }

    /// Text-only inference: `txt_tokens: [L, N, D]`, `txt_eos: [N, D]`
    pub fn forward_text(
        &self,
        txt_tokens: &Tensor,
        txt_eos: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<HashOutput> {
        debug!(txt_tokens = ?txt_tokens.dims(), "text forward");
        Ok(HashOutput {
            image: None,
            text: Some(self.text.forward(txt_tokens, txt_eos, key_padding_mask, train)?),
        })
    }
}

impl Parameterized for HashingModel {
    /// The shared concept learner is listed once, under `gcl`.
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.concept().collect_vars(&join_name(prefix, "gcl"), out);
        self.image.collect_own_vars(&join_name(prefix, "image"), out);
        self.text.collect_own_vars(&join_name(prefix, "text"), out);
    }
}

// ============================================================================
// Retrieval helpers
// ============================================================================

/// Sign of a hash code as {-1, +1}; exact zeros map to +1.
pub fn binarize(code: &Tensor) -> Result<Tensor> {
    let zeros = code
        .zeros_like()
        .map_err(|e| HashCoreError::Tensor(format!("binarize zeros failed: {}", e)))?;
    let positive = code
        .ge(&zeros)
        .map_err(|e| HashCoreError::Tensor(format!("binarize compare failed: {}", e)))?;
    let ones = zeros
        .ones_like()
        .map_err(|e| HashCoreError::Tensor(format!("binarize ones failed: {}", e)))?;
    let minus_ones = ones
        .neg()
        .map_err(|e| HashCoreError::Tensor(format!("binarize neg failed: {}", e)))?;
    positive
        .where_cond(&ones, &minus_ones)
        .map_err(|e| HashCoreError::Tensor(format!("binarize where failed: {}", e)))
}

/// Pairwise Hamming distances between {-1, +1} codes.
///
/// `a: [Na, K]`, `b: [Nb, K]` -> `[Na, Nb]`, computed as `0.5 * (K - a·bᵀ)`.
pub fn hamming_distance(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (_, k) = a
        .dims2()
        .map_err(|e| HashCoreError::Shape(format!("hamming lhs must be NK: {}", e)))?;
    expect_dims(b, "hamming rhs", "NK", &[None, Some(k)])?;

    let bt = b
        .t()
        .map_err(|e| HashCoreError::Tensor(format!("hamming transpose failed: {}", e)))?
        .contiguous()
        .map_err(|e| HashCoreError::Tensor(format!("hamming contiguous failed: {}", e)))?;
    let inner = a
        .contiguous()
        .map_err(|e| HashCoreError::Tensor(format!("hamming contiguous failed: {}", e)))?
        .matmul(&bt)
        .map_err(|e| HashCoreError::Tensor(format!("hamming matmul failed: {}", e)))?;

    inner
        .affine(-0.5, 0.5 * k as f64)
        .map_err(|e| HashCoreError::Tensor(format!("hamming affine failed: {}", e)))
}

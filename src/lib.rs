//! # concept-hash
//!
//! Cross-modal concept hashing on top of a pretrained vision-language encoder.
//!
//! ## Overview
//!
//! Given per-token and pooled embeddings for images and texts, this crate
//! learns a shared set of K latent concepts and turns every sample into a
//! K-bit quasi-binary code (one bit per concept) for each modality.
//!
//! Core capabilities:
//!
//! - **Concept**: shared global concept learner, top-k localized token
//!   aggregation, slot transformer and per-bit hashing head
//! - **Model**: two-branch (image/text) composition with a single shared
//!   concept projection
//! - **Layers**: linear, layer norm, dropout and multi-head attention built
//!   from differentiable candle primitives
//! - **Checkpoint**: safetensors persistence with a JSON metadata sidecar
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use concept_hash::prelude::*;
//!
//! let config = HashConfig::default().with_embed_dim(512).with_k_bits(16);
//! let device = best_device();
//! let model = HashingModel::new(&config, &device)?;
//!
//! // img_tokens: [L, N, D]   img_cls: [N, D]
//! // txt_tokens: [L, N, D]   txt_eos: [N, D]   padding: [N, L]
//! let out = model.forward(&img_tokens, &txt_tokens, &img_cls, &txt_eos, Some(&padding), false)?;
//! if let Some(image) = &out.image {
//!     let codes = binarize(&image.token_hash)?;
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod checkpoint;
pub mod concept;
pub mod config;
pub mod layers;
pub mod model;
pub mod primitives;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for concept hashing operations
#[derive(Debug, thiserror::Error)]
pub enum HashCoreError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for concept hashing operations
pub type Result<T> = std::result::Result<T, HashCoreError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{HashCoreError, Result};

    // Primitives
    pub use crate::primitives::{
        best_device, cpu_device, gpu_disabled, l2_normalize, nan_to_zero,
    };

    // Configuration
    pub use crate::config::{Activation, HashConfig};

    // Concept pipeline
    pub use crate::concept::{
        BitwiseHashing, GlobalConceptLearner, LocalConceptOutput, LocalConceptTransformer,
        LocalizedTokenAggregation, PositionalEncoding, ResidualMlp,
    };

    // Model
    pub use crate::model::{
        binarize, hamming_distance, HashOutput, HashingModel, ModalityBranch, ModalityOutput,
    };

    // Checkpoints
    pub use crate::checkpoint::CheckpointMetadata;
}

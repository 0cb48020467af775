//! Model configuration
//!
//! [`HashConfig`] carries every hyperparameter of the hashing model. It is
//! usually parsed from a TOML file:
//!
//! ```toml
//! embed_dim = 512
//! k_bits = 16
//! dropout = 0.1
//! transformer_layers = 2
//! activation = "gelu"
//! res_mlp_layers = 1
//! top_k_label = 8
//! ```

use std::path::Path;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{HashCoreError, Result};

fn default_embed_dim() -> usize {
    512
}

fn default_k_bits() -> usize {
    16
}

fn default_transformer_layers() -> usize {
    2
}

fn default_top_k_label() -> usize {
    8
}

/// Activation function for the residual MLP
///
/// Parsed case-insensitively from `"relu"` / `"gelu"`. Any other string maps
/// to [`Activation::None`] (identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum Activation {
    /// Rectified Linear Unit: max(0, x)
    #[default]
    ReLU,
    /// Gaussian Error Linear Unit (exact erf form)
    GELU,
    /// No activation (identity)
    None,
}

impl Activation {
    /// Apply this activation function to a tensor
    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        match self {
            Self::ReLU => crate::primitives::relu(tensor),
            Self::GELU => crate::primitives::gelu(tensor),
            Self::None => Ok(tensor.clone()),
        }
    }
}

impl From<String> for Activation {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "relu" => Self::ReLU,
            "gelu" => Self::GELU,
            _ => Self::None,
        }
    }
}

impl From<Activation> for String {
    fn from(a: Activation) -> Self {
        match a {
            Activation::ReLU => "relu".into(),
            Activation::GELU => "gelu".into(),
            Activation::None => "none".into(),
        }
    }
}

/// Hyperparameters of the hashing model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashConfig {
    /// Backbone embedding width (D)
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Hash code length; also the number of latent concepts (K)
    #[serde(default = "default_k_bits")]
    pub k_bits: usize,

    /// Dropout rate for the residual MLP
    #[serde(default)]
    pub dropout: f32,

    /// Depth of the slot transformer
    #[serde(default = "default_transformer_layers")]
    pub transformer_layers: usize,

    /// Attention heads in the slot transformer (defaults to `max(D / 64, 1)`)
    #[serde(default)]
    pub transformer_heads: Option<usize>,

    /// Residual MLP activation
    #[serde(default)]
    pub activation: Activation,

    /// Residual MLP depth, 0 disables it
    #[serde(default)]
    pub res_mlp_layers: usize,

    /// Number of tokens selected per concept
    #[serde(default = "default_top_k_label")]
    pub top_k_label: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            embed_dim: default_embed_dim(),
            k_bits: default_k_bits(),
            dropout: 0.0,
            transformer_layers: default_transformer_layers(),
            transformer_heads: None,
            activation: Activation::default(),
            res_mlp_layers: 0,
            top_k_label: default_top_k_label(),
        }
    }
}

impl HashConfig {
    /// Load and validate a configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(HashCoreError::Io)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML source
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| HashCoreError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of attention heads the slot transformer uses
    pub fn heads(&self) -> usize {
        self.transformer_heads
            .unwrap_or_else(|| (self.embed_dim / 64).max(1))
    }

    /// Check every invariant the model relies on
    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 || !self.embed_dim.is_multiple_of(2) {
            return Err(HashCoreError::Config(format!(
                "embed_dim must be a positive even number, got {}",
                self.embed_dim
            )));
        }
        if self.k_bits == 0 {
            return Err(HashCoreError::Config("k_bits must be positive".into()));
        }
        if self.top_k_label == 0 {
            return Err(HashCoreError::Config("top_k_label must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(HashCoreError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        let heads = self.heads();
        if heads == 0 || !self.embed_dim.is_multiple_of(heads) {
            return Err(HashCoreError::Config(format!(
                "embed_dim ({}) must be divisible by transformer_heads ({})",
                self.embed_dim, heads
            )));
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON form, used to match checkpoints to configs
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)
            .map_err(|e| HashCoreError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Builder: set embedding width
    pub fn with_embed_dim(mut self, embed_dim: usize) -> Self {
        self.embed_dim = embed_dim;
        self
    }

    /// Builder: set hash length / concept count
    pub fn with_k_bits(mut self, k_bits: usize) -> Self {
        self.k_bits = k_bits;
        self
    }

    /// Builder: set dropout rate
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Builder: set transformer depth
    pub fn with_transformer_layers(mut self, layers: usize) -> Self {
        self.transformer_layers = layers;
        self
    }

    /// Builder: set transformer head count
    pub fn with_transformer_heads(mut self, heads: usize) -> Self {
        self.transformer_heads = Some(heads);
        self
    }

    /// Builder: set residual MLP activation
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Builder: set residual MLP depth
    pub fn with_res_mlp_layers(mut self, layers: usize) -> Self {
        self.res_mlp_layers = layers;
        self
    }

    /// Builder: set top-k selection size
    pub fn with_top_k_label(mut self, top_k: usize) -> Self {
        self.top_k_label = top_k;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HashConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heads(), 8);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            embed_dim = 128
            k_bits = 32
            dropout = 0.1
            activation = "GELU"
            res_mlp_layers = 2
            top_k_label = 4
        "#;

        let config = HashConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.embed_dim, 128);
        assert_eq!(config.k_bits, 32);
        assert_eq!(config.activation, Activation::GELU);
        assert_eq!(config.res_mlp_layers, 2);
        assert_eq!(config.top_k_label, 4);
        // Unset fields keep their defaults
        assert_eq!(config.transformer_layers, 2);
        assert_eq!(config.heads(), 2);
    }

    #[test]
    fn test_unknown_activation_is_identity() {
        let config = HashConfig::from_toml_str(r#"activation = "swish""#).unwrap();
        assert_eq!(config.activation, Activation::None);
    }

    #[test]
    fn test_rejects_odd_embed_dim() {
        let config = HashConfig::default().with_embed_dim(7).with_transformer_heads(1);
        assert!(matches!(config.validate(), Err(HashCoreError::Config(_))));
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let config = HashConfig::default().with_embed_dim(10).with_transformer_heads(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_dropout_and_zero_sizes() {
        assert!(HashConfig::default().with_dropout(1.0).validate().is_err());
        assert!(HashConfig::default().with_k_bits(0).validate().is_err());
        assert!(HashConfig::default().with_top_k_label(0).validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = HashConfig::default();
        let b = HashConfig::default();
        let c = HashConfig::default().with_k_bits(64);

        let fa = a.fingerprint().unwrap();
        assert_eq!(fa, b.fingerprint().unwrap());
        assert_ne!(fa, c.fingerprint().unwrap());
        assert_eq!(fa.len(), 64);
        assert!(fa.chars().all(|ch| ch.is_ascii_hexdigit()));

        // Not the digest of an empty string
        let empty = format!("{:x}", Sha256::digest(b""));
        assert_ne!(fa, empty);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("concept_hash_test_config.toml");
        std::fs::write(&path, "embed_dim = 64\nk_bits = 8\n").unwrap();

        let config = HashConfig::load(&path).unwrap();
        assert_eq!(config.embed_dim, 64);
        assert_eq!(config.k_bits, 8);

        std::fs::remove_file(path).ok();
    }
}

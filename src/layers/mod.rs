//! Differentiable layers
//!
//! Every layer stores its parameters as candle [`Var`]s so gradients reach
//! them through `Tensor::backward`, and exposes them through [`Parameterized`]
//! for optimizers and checkpoints.
//!
//! - [`Linear`]: affine projection applied over the last axis of any rank
//! - [`LayerNorm`]: learned normalization over the last axis
//! - [`Dropout`]: inverted dropout, active only in training mode
//! - [`MultiHeadAttention`]: scaled dot-product self-attention over LND sequences
//! - [`SlotTransformer`]: stack of pre-norm residual attention blocks

pub mod attention;
pub mod dropout;
pub mod linear;
pub mod norm;
pub mod transformer;

pub use attention::MultiHeadAttention;
pub use dropout::Dropout;
pub use linear::Linear;
pub use norm::LayerNorm;
pub use transformer::{ResidualAttentionBlock, SlotTransformer};

use candle_core::Var;

/// Anything that owns trainable parameters.
///
/// Implementors push `(name, var)` pairs; names are dotted paths rooted at
/// `prefix` and must be unique within a model.
pub trait Parameterized {
    /// Append this component's parameters under `prefix`
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>);

    /// All parameters with their dotted names
    fn named_vars(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        self.collect_vars("", &mut out);
        out
    }

    /// All trainable variables, e.g. for `candle_nn::optim::AdamW`
    fn trainable_vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    /// Total scalar parameter count
    fn param_count(&self) -> usize {
        self.named_vars()
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum()
    }
}

/// Join a parameter prefix and a local name with a dot.
pub(crate) fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_name() {
        assert_eq!(join_name("", "weight"), "weight");
        assert_eq!(join_name("image.proj", "bias"), "image.proj.bias");
    }
}

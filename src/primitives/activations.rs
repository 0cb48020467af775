//! Pointwise nonlinearities and the sequence softmax
//!
//! `tanh` bounds every hash code, `softmax` turns thresholded concept scores
//! into aggregation weights, `gelu`/`relu` feed the residual MLP and
//! `quick_gelu` the slot transformer.

use candle_core::Tensor;
use crate::{HashCoreError, Result};

/// Logistic function `1 / (1 + exp(-x))`
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    let denom = x
        .neg()
        .and_then(|t| t.exp())
        .and_then(|t| t + 1.0)
        .map_err(|e| HashCoreError::Tensor(format!("sigmoid denominator failed: {}", e)))?;
    denom
        .recip()
        .map_err(|e| HashCoreError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Normalize along `dim`.
///
/// `-inf` entries get weight 0; a slice that is entirely `-inf` comes out as
/// NaN and is left for [`super::nan_to_zero`].
pub fn softmax(x: &Tensor, dim: usize) -> Result<Tensor> {
    candle_nn::ops::softmax(x, dim)
        .map_err(|e| HashCoreError::Tensor(format!("softmax over dim {} failed: {}", dim, e)))
}

pub fn relu(x: &Tensor) -> Result<Tensor> {
    x.relu()
        .map_err(|e| HashCoreError::Tensor(format!("relu failed: {}", e)))
}

/// Squashes concept logits into the (-1, 1) code range
pub fn tanh(x: &Tensor) -> Result<Tensor> {
    x.tanh()
        .map_err(|e| HashCoreError::Tensor(format!("tanh failed: {}", e)))
}

/// Exact GELU, `x * Φ(x)` with the erf-based normal CDF
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    x.gelu_erf()
        .map_err(|e| HashCoreError::Tensor(format!("gelu failed: {}", e)))
}

/// `x * sigmoid(1.702 x)`
pub fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    let scaled = (x * 1.702)
        .map_err(|e| HashCoreError::Tensor(format!("quick_gelu scale failed: {}", e)))?;
    let gate = sigmoid(&scaled)?;
    x.mul(&gate)
        .map_err(|e| HashCoreError::Tensor(format!("quick_gelu mul failed: {}", e)))
}

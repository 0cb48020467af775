//! Multi-head self-attention for LND sequences
//!
//! Scaled dot-product attention with biased Q/K/V/O projections, matching the
//! layout of a standard transformer encoder layer.

use candle_core::{Device, Tensor, Var};

use super::{Linear, Parameterized};
use crate::{HashCoreError, Result};

/// Multi-head self-attention parameters and forward pass
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    /// Number of attention heads
    pub num_heads: usize,
    /// Dimension per head (hidden_dim / num_heads)
    pub head_dim: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
}

impl MultiHeadAttention {
    pub fn new(hidden_dim: usize, num_heads: usize, device: &Device) -> Result<Self> {
        if num_heads == 0 || !hidden_dim.is_multiple_of(num_heads) {
            return Err(HashCoreError::Config(format!(
                "hidden_dim ({}) must be divisible by num_heads ({})",
                hidden_dim, num_heads
            )));
        }

        Ok(Self {
            num_heads,
            head_dim: hidden_dim / num_heads,
            q_proj: Linear::new(hidden_dim, hidden_dim, true, device)?,
            k_proj: Linear::new(hidden_dim, hidden_dim, true, device)?,
            v_proj: Linear::new(hidden_dim, hidden_dim, true, device)?,
            out_proj: Linear::new(hidden_dim, hidden_dim, true, device)?,
        })
    }

    fn hidden_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// [N, L, D] -> [N, H, L, head_dim]
    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))
            .map_err(|e| HashCoreError::Tensor(format!("attention head reshape failed: {}", e)))?
            .transpose(1, 2)
            .map_err(|e| HashCoreError::Tensor(format!("attention head transpose failed: {}", e)))?
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("attention contiguous failed: {}", e)))
    }

    /// Self-attention over `x: [L, N, D]`.
    ///
    /// Returns the attended sequence `[L, N, D]` and the attention weights
    /// `[N, H, L, L]`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (seq_len, batch, dim) = x.dims3().map_err(|e| {
            HashCoreError::Shape(format!("attention expects LND input: {}", e))
        })?;
        if dim != self.hidden_dim() {
            return Err(HashCoreError::Shape(format!(
                "attention expects width {}, got {}",
                self.hidden_dim(),
                dim
            )));
        }

        // LND -> NLD
        let x = x
            .transpose(0, 1)
            .map_err(|e| HashCoreError::Tensor(format!("attention input transpose failed: {}", e)))?;

        let q = self.split_heads(&self.q_proj.forward(&x)?, batch, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(&x)?, batch, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(&x)?, batch, seq_len)?;

        let scale = (self.head_dim as f64).sqrt();

        let k_t = k
            .transpose(2, 3)
            .map_err(|e| HashCoreError::Tensor(format!("attention K transpose failed: {}", e)))?
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("attention K contiguous failed: {}", e)))?;

        let scores = q
            .matmul(&k_t)
            .map_err(|e| HashCoreError::Tensor(format!("attention scores matmul failed: {}", e)))?
            .affine(1.0 / scale, 0.0)
            .map_err(|e| HashCoreError::Tensor(format!("attention scale failed: {}", e)))?;

        let attn_weights = crate::primitives::softmax(&scores, 3)?;

        let attn_output = attn_weights
            .matmul(&v)
            .map_err(|e| HashCoreError::Tensor(format!("attention output matmul failed: {}", e)))?
            .transpose(1, 2)
            .map_err(|e| HashCoreError::Tensor(format!("attention merge transpose failed: {}", e)))?
            .reshape((batch, seq_len, self.hidden_dim()))
            .map_err(|e| HashCoreError::Tensor(format!("attention merge reshape failed: {}", e)))?;

        let out = self
            .out_proj
            .forward(&attn_output)?
            .transpose(0, 1)
            .map_err(|e| HashCoreError::Tensor(format!("attention output transpose failed: {}", e)))?;

        Ok((out, attn_weights))
    }
}

impl Parameterized for MultiHeadAttention {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.q_proj.collect_vars(&super::join_name(prefix, "q_proj"), out);
        self.k_proj.collect_vars(&super::join_name(prefix, "k_proj"), out);
        self.v_proj.collect_vars(&super::join_name(prefix, "v_proj"), out);
        self.out_proj.collect_vars(&super::join_name(prefix, "out_proj"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::D;

    #[test]
    fn test_creation() {
        let attn = MultiHeadAttention::new(16, 4, &Device::Cpu).unwrap();
        assert_eq!(attn.num_heads, 4);
        assert_eq!(attn.head_dim, 4);
        // 4 projections of 16x16 weights + 16 bias
        assert_eq!(attn.param_count(), 4 * (16 * 16 + 16));
    }

    #[test]
    fn test_invalid_heads() {
        assert!(MultiHeadAttention::new(10, 3, &Device::Cpu).is_err());
        assert!(MultiHeadAttention::new(10, 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_forward_shapes_and_rows_sum_to_one() {
        let device = Device::Cpu;
        let attn = MultiHeadAttention::new(8, 2, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (5, 3, 8), &device).unwrap();

        let (out, weights) = attn.forward(&x).unwrap();
        assert_eq!(out.dims(), &[5, 3, 8]);
        assert_eq!(weights.dims(), &[3, 2, 5, 5]);

        let sums = weights.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let device = Device::Cpu;
        let attn = MultiHeadAttention::new(8, 2, &device).unwrap();
        let x = Tensor::zeros((5, 3, 4), candle_core::DType::F32, &device).unwrap();

        assert!(matches!(attn.forward(&x), Err(HashCoreError::Shape(_))));
    }
}

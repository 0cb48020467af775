//! Pre-norm transformer encoder used to contextualize concept slots

use candle_core::{Device, Tensor, Var};

use super::{join_name, LayerNorm, Linear, MultiHeadAttention, Parameterized};
use crate::{HashCoreError, Result};

/// `x + attn(ln_1(x))` followed by `x + mlp(ln_2(x))`
///
/// The MLP expands to 4x width with QuickGELU in between.
#[derive(Debug, Clone)]
pub struct ResidualAttentionBlock {
    ln_1: LayerNorm,
    attn: MultiHeadAttention,
    ln_2: LayerNorm,
    c_fc: Linear,
    c_proj: Linear,
}

impl ResidualAttentionBlock {
    pub fn new(width: usize, heads: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::new(width, device)?,
            attn: MultiHeadAttention::new(width, heads, device)?,
            ln_2: LayerNorm::new(width, device)?,
            c_fc: Linear::new(width, 4 * width, true, device)?,
            c_proj: Linear::new(4 * width, width, true, device)?,
        })
    }

    /// `x: [L, N, D]` -> (`[L, N, D]`, attention weights `[N, H, L, L]`)
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (attn_out, weights) = self.attn.forward(&self.ln_1.forward(x)?)?;
        let x = (x + attn_out)
            .map_err(|e| HashCoreError::Tensor(format!("attention residual add failed: {}", e)))?;

        let h = self.c_fc.forward(&self.ln_2.forward(&x)?)?;
        let h = crate::primitives::quick_gelu(&h)?;
        let h = self.c_proj.forward(&h)?;

        let x = (x + h)
            .map_err(|e| HashCoreError::Tensor(format!("mlp residual add failed: {}", e)))?;
        Ok((x, weights))
    }
}

impl Parameterized for ResidualAttentionBlock {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.ln_1.collect_vars(&join_name(prefix, "ln_1"), out);
        self.attn.collect_vars(&join_name(prefix, "attn"), out);
        self.ln_2.collect_vars(&join_name(prefix, "ln_2"), out);
        self.c_fc.collect_vars(&join_name(prefix, "mlp.c_fc"), out);
        self.c_proj.collect_vars(&join_name(prefix, "mlp.c_proj"), out);
    }
}

/// Stack of [`ResidualAttentionBlock`]s over a short slot sequence
#[derive(Debug, Clone)]
pub struct SlotTransformer {
    width: usize,
    blocks: Vec<ResidualAttentionBlock>,
}

impl SlotTransformer {
    pub fn new(width: usize, layers: usize, heads: usize, device: &Device) -> Result<Self> {
        let blocks = (0..layers)
            .map(|_| ResidualAttentionBlock::new(width, heads, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { width, blocks })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Run every block in order.
    ///
    /// Returns the output `[L, N, D]` and the last block's attention weights,
    /// `None` for a zero-depth stack.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let mut x = x.clone();
        let mut last_weights = None;
        for block in &self.blocks {
            let (y, w) = block.forward(&x)?;
            x = y;
            last_weights = Some(w);
        }
        Ok((x, last_weights))
    }
}

impl Parameterized for SlotTransformer {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_vars(&join_name(prefix, &format!("resblocks.{}", i)), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_preserves_shape() {
        let device = Device::Cpu;
        let t = SlotTransformer::new(8, 2, 2, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (4, 3, 8), &device).unwrap();

        let (y, w) = t.forward(&x).unwrap();
        assert_eq!(y.dims(), &[4, 3, 8]);
        assert_eq!(w.unwrap().dims(), &[3, 2, 4, 4]);
        assert_eq!(t.depth(), 2);
    }

    #[test]
    fn test_zero_depth_is_identity() {
        let device = Device::Cpu;
        let t = SlotTransformer::new(8, 0, 1, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (4, 3, 8), &device).unwrap();

        let (y, w) = t.forward(&x).unwrap();
        assert!(w.is_none());
        let diff = (y - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_param_names_are_unique() {
        let device = Device::Cpu;
        let t = SlotTransformer::new(8, 2, 2, &device).unwrap();
        let names: Vec<String> = t.named_vars().into_iter().map(|(n, _)| n).collect();

        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.contains(&"resblocks.1.mlp.c_proj.bias".to_string()));
    }
}

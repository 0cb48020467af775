//! Layer normalization

use candle_core::{DType, Device, Tensor, Var, D};

use super::{join_name, Parameterized};
use crate::{HashCoreError, Result};

/// LayerNorm(x) = gamma * (x - mean) / sqrt(var + eps) + beta
///
/// Statistics are taken over the last axis. Built from elementwise ops so
/// gradients flow to gamma, beta and the input.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    gamma: Var,
    beta: Var,
    eps: f64,
}

impl LayerNorm {
    /// Identity-initialized norm (gamma = 1, beta = 0), eps 1e-5
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let gamma = Var::ones(dim, DType::F32, device)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm gamma init failed: {}", e)))?;
        let beta = Var::zeros(dim, DType::F32, device)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm beta init failed: {}", e)))?;
        Ok(Self {
            gamma,
            beta,
            eps: 1e-5,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dim = self.gamma.as_tensor().elem_count();
        if x.dims().last() != Some(&dim) {
            return Err(HashCoreError::Shape(format!(
                "layer_norm expects last dim {}, got {:?}",
                dim,
                x.dims()
            )));
        }

        let mean = x
            .mean_keepdim(D::Minus1)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm mean failed: {}", e)))?;

        let x_centered = x
            .broadcast_sub(&mean)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm center failed: {}", e)))?;

        let var = x_centered
            .sqr()
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm sqr failed: {}", e)))?
            .mean_keepdim(D::Minus1)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm var mean failed: {}", e)))?;

        let std = var
            .affine(1.0, self.eps)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm eps failed: {}", e)))?
            .sqrt()
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm sqrt failed: {}", e)))?;

        let normalized = x_centered
            .broadcast_div(&std)
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm div failed: {}", e)))?;

        normalized
            .broadcast_mul(self.gamma.as_tensor())
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm scale failed: {}", e)))?
            .broadcast_add(self.beta.as_tensor())
            .map_err(|e| HashCoreError::Tensor(format!("layer_norm shift failed: {}", e)))
    }
}

impl Parameterized for LayerNorm {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "weight"), self.gamma.clone()));
        out.push((join_name(prefix, "bias"), self.beta.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_mean_unit_variance() {
        let device = Device::Cpu;
        let ln = LayerNorm::new(4, &device).unwrap();
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 14.0], (2, 4), &device)
            .unwrap();

        let y = ln.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for row in y {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_applies_over_last_axis_of_3d() {
        let device = Device::Cpu;
        let ln = LayerNorm::new(8, &device).unwrap();
        let x = Tensor::randn(0.0f32, 3.0, (3, 2, 8), &device).unwrap();

        let y = ln.forward(&x).unwrap();
        assert_eq!(y.dims(), &[3, 2, 8]);
    }

    #[test]
    fn test_rejects_wrong_width() {
        let device = Device::Cpu;
        let ln = LayerNorm::new(8, &device).unwrap();
        let x = Tensor::zeros((2, 4), DType::F32, &device).unwrap();

        assert!(ln.forward(&x).is_err());
    }
}

//! Residual feed-forward stack
//!
//! Each layer computes `x + fc2(dropout(act(fc1(ln(x)))))` with `fc1: D → 4D`
//! and `fc2: 4D → D`. Works on any rank with D on the last axis.

use candle_core::{Device, Tensor, Var};

use crate::config::Activation;
use crate::layers::{join_name, Dropout, LayerNorm, Linear, Parameterized};
use crate::{HashCoreError, Result};

#[derive(Debug, Clone)]
struct ResidualLayer {
    ln: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

/// Stack of pre-norm residual MLP layers
#[derive(Debug, Clone)]
pub struct ResidualMlp {
    layers: Vec<ResidualLayer>,
    activation: Activation,
    dropout: Dropout,
}

impl ResidualMlp {
    pub fn new(
        dim: usize,
        num_layers: usize,
        activation: Activation,
        dropout: f32,
        device: &Device,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(HashCoreError::Config(
                "residual MLP needs at least one layer; skip it instead".into(),
            ));
        }

        let layers = (0..num_layers)
            .map(|_| {
                Ok(ResidualLayer {
                    ln: LayerNorm::new(dim, device)?,
                    fc1: Linear::new(dim, 4 * dim, true, device)?,
                    fc2: Linear::new(4 * dim, dim, true, device)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            let h = layer.fc1.forward(&layer.ln.forward(&x)?)?;
            let h = self.activation.apply(&h)?;
            let h = self.dropout.forward(&h, train)?;
            let h = layer.fc2.forward(&h)?;
            x = (x + h)
                .map_err(|e| HashCoreError::Tensor(format!("residual mlp add failed: {}", e)))?;
        }
        Ok(x)
    }
}

impl Parameterized for ResidualMlp {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.ln.collect_vars(&join_name(prefix, &format!("lns.{}", i)), out);
            layer.fc1.collect_vars(&join_name(prefix, &format!("mlps.{}.fc1", i)), out);
            layer.fc2.collect_vars(&join_name(prefix, &format!("mlps.{}.fc2", i)), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserves_shape() {
        let device = Device::Cpu;
        let mlp = ResidualMlp::new(8, 2, Activation::GELU, 0.1, &device).unwrap();

        let pooled = Tensor::randn(0.0f32, 1.0, (3, 8), &device).unwrap();
        assert_eq!(mlp.forward(&pooled, false).unwrap().dims(), &[3, 8]);

        let tokens = Tensor::randn(0.0f32, 1.0, (5, 3, 8), &device).unwrap();
        assert_eq!(mlp.forward(&tokens, true).unwrap().dims(), &[5, 3, 8]);
    }

    #[test]
    fn test_zero_layers_rejected() {
        assert!(ResidualMlp::new(8, 0, Activation::ReLU, 0.0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_param_count() {
        let mlp = ResidualMlp::new(4, 1, Activation::None, 0.0, &Device::Cpu).unwrap();
        // ln: 4 + 4, fc1: 4*16 + 16, fc2: 16*4 + 4
        assert_eq!(mlp.param_count(), 8 + 80 + 68);
        assert_eq!(mlp.num_layers(), 1);
    }

    #[test]
    fn test_zeroed_output_projection_is_identity() {
        let device = Device::Cpu;
        let mlp = ResidualMlp::new(4, 1, Activation::ReLU, 0.0, &device).unwrap();
        for (name, var) in mlp.named_vars() {
            if name.contains("fc2") {
                var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
            }
        }

        let x = Tensor::randn(0.0f32, 1.0, (2, 4), &device).unwrap();
        let y = mlp.forward(&x, false).unwrap();
        assert_eq!(x.to_vec2::<f32>().unwrap(), y.to_vec2::<f32>().unwrap());
    }
}

//! Inverted dropout

use candle_core::Tensor;

use crate::{HashCoreError, Result};

/// Randomly zero elements with probability `rate` and scale the rest by
/// `1 / (1 - rate)`. Identity outside training.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.rate <= 0.0 {
            return Ok(x.clone());
        }
        if self.rate >= 1.0 {
            return x
                .zeros_like()
                .map_err(|e| HashCoreError::Tensor(format!("dropout zeros failed: {}", e)));
        }
        candle_nn::ops::dropout(x, self.rate)
            .map_err(|e| HashCoreError::Tensor(format!("dropout failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_eval_mode_is_identity() {
        let x = Tensor::randn(0.0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let y = Dropout::new(0.5).forward(&x, false).unwrap();

        assert_eq!(x.to_vec2::<f32>().unwrap(), y.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_train_mode_zeroes_or_scales() {
        let x = Tensor::ones((16, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = Dropout::new(0.5).forward(&x, true).unwrap();

        let vals = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
    }
}

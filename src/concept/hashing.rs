//! Per-bit hashing head
//!
//! Bit `k` is `tanh(w_k · slot_k + b_k)`. The K independent `D → 1`
//! projections are stored as one `[K, D, 1]` weight and applied with a single
//! batched matmul, which is the block-diagonal form of K separate layers:
//! bit `k` never sees another slot's weights.

use candle_core::{Device, Tensor, Var};

use crate::layers::{join_name, Parameterized};
use crate::{HashCoreError, Result};

/// K independent `D → 1` projections followed by tanh
#[derive(Debug, Clone)]
pub struct BitwiseHashing {
    /// `[K, D, 1]`
    weight: Var,
    /// `[K, 1]`
    bias: Var,
    k_bits: usize,
    dim: usize,
}

impl BitwiseHashing {
    pub fn new(dim: usize, k_bits: usize, device: &Device) -> Result<Self> {
        let bound = 1.0f32 / (dim.max(1) as f32).sqrt();

        let weight = Var::from_tensor(
            &Tensor::rand(-bound, bound, (k_bits, dim, 1), device)
                .map_err(|e| HashCoreError::Tensor(format!("Failed to create hash weight: {}", e)))?,
        )
        .map_err(|e| HashCoreError::Tensor(format!("Failed to create hash weight var: {}", e)))?;

        let bias = Var::from_tensor(
            &Tensor::rand(-bound, bound, (k_bits, 1), device)
                .map_err(|e| HashCoreError::Tensor(format!("Failed to create hash bias: {}", e)))?,
        )
        .map_err(|e| HashCoreError::Tensor(format!("Failed to create hash bias var: {}", e)))?;

        Ok(Self {
            weight,
            bias,
            k_bits,
            dim,
        })
    }

    pub fn k_bits(&self) -> usize {
        self.k_bits
    }

    /// Projection weights, `[K, D, 1]`
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Projection biases, `[K, 1]`
    pub fn bias(&self) -> &Var {
        &self.bias
    }

    /// `slots: [K, N, D]` -> hash code `[N, K]` in (-1, 1)
    pub fn forward(&self, slots: &Tensor) -> Result<Tensor> {
        let (k, _n, d) = slots.dims3().map_err(|e| {
            HashCoreError::Shape(format!("bitwise hashing expects KND input: {}", e))
        })?;
        if k != self.k_bits || d != self.dim {
            return Err(HashCoreError::Shape(format!(
                "bitwise hashing expects [{}, _, {}], got {:?}",
                self.k_bits,
                self.dim,
                slots.dims()
            )));
        }

        let slots = slots
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("hash contiguous failed: {}", e)))?;

        // [K, N, D] @ [K, D, 1] -> [K, N, 1]
        let logits = slots
            .matmul(self.weight.as_tensor())
            .map_err(|e| HashCoreError::Tensor(format!("hash matmul failed: {}", e)))?
            .squeeze(2)
            .map_err(|e| HashCoreError::Tensor(format!("hash squeeze failed: {}", e)))?
            .broadcast_add(self.bias.as_tensor())
            .map_err(|e| HashCoreError::Tensor(format!("hash add bias failed: {}", e)))?;

        // [K, N] -> [N, K]; explicit axes so K = 1 or N = 1 keep both dims
        let logits = logits
            .transpose(0, 1)
            .map_err(|e| HashCoreError::Tensor(format!("hash transpose failed: {}", e)))?
            .contiguous()
            .map_err(|e| HashCoreError::Tensor(format!("hash contiguous failed: {}", e)))?;

        crate::primitives::tanh(&logits)
    }
}

impl Parameterized for BitwiseHashing {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
        out.push((join_name(prefix, "bias"), self.bias.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_known_values() {
        let head = BitwiseHashing::new(2, 2, &device()).unwrap();
        // bit 0 reads channel 0, bit 1 reads channel 1
        head.weight()
            .set(&Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (2, 2, 1), &device()).unwrap())
            .unwrap();
        head.bias()
            .set(&Tensor::from_vec(vec![0.0f32, 0.5], (2, 1), &device()).unwrap())
            .unwrap();

        // slots[k][n]
        let slots = Tensor::from_vec(
            vec![0.3f32, 9.0, -0.2, 9.0, 9.0, 0.1, 9.0, -0.4],
            (2, 2, 2),
            &device(),
        )
        .unwrap();

        let code = head.forward(&slots).unwrap().to_vec2::<f32>().unwrap();
        assert!((code[0][0] - 0.3f32.tanh()).abs() < 1e-6);
        assert!((code[1][0] - (-0.2f32).tanh()).abs() < 1e-6);
        assert!((code[0][1] - 0.6f32.tanh()).abs() < 1e-6);
        assert!((code[1][1] - 0.1f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_bits_are_independent() {
        let head = BitwiseHashing::new(4, 3, &device()).unwrap();
        let slots = Tensor::randn(0.0f32, 1.0, (3, 2, 4), &device()).unwrap();
        let before = head.forward(&slots).unwrap().to_vec2::<f32>().unwrap();

        // Perturb only bit 1's projection
        let w = head.weight().as_tensor().to_vec3::<f32>().unwrap();
        let mut flat: Vec<f32> = w.into_iter().flatten().flatten().collect();
        for v in flat.iter_mut().skip(4).take(4) {
            *v += 1.0;
        }
        head.weight()
            .set(&Tensor::from_vec(flat, (3, 4, 1), &device()).unwrap())
            .unwrap();
        let after = head.forward(&slots).unwrap().to_vec2::<f32>().unwrap();

        for n in 0..2 {
            assert_eq!(before[n][0], after[n][0]);
            assert_eq!(before[n][2], after[n][2]);
        }
        assert_ne!(before[0][1], after[0][1]);
    }

    #[test]
    fn test_single_bit_single_sample_keeps_both_axes() {
        let head = BitwiseHashing::new(4, 1, &device()).unwrap();
        let slots = Tensor::randn(0.0f32, 1.0, (1, 1, 4), &device()).unwrap();
        assert_eq!(head.forward(&slots).unwrap().dims(), &[1, 1]);

        let slots = Tensor::randn(0.0f32, 1.0, (1, 5, 4), &device()).unwrap();
        assert_eq!(head.forward(&slots).unwrap().dims(), &[5, 1]);
    }

    #[test]
    fn test_output_bounded() {
        let head = BitwiseHashing::new(4, 8, &device()).unwrap();
        let slots = Tensor::randn(0.0f32, 100.0, (8, 3, 4), &device()).unwrap();
        let vals = head.forward(&slots).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| *v >= -1.0 && *v <= 1.0));
    }

    #[test]
    fn test_rejects_wrong_slot_count() {
        let head = BitwiseHashing::new(4, 8, &device()).unwrap();
        let slots = Tensor::zeros((4, 3, 4), DType::F32, &device()).unwrap();
        assert!(matches!(head.forward(&slots), Err(HashCoreError::Shape(_))));
    }
}

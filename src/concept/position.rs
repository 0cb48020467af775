//! Sinusoidal slot position encoding
//!
//! Aggregation throws away token order, so slot `k`'s only positional
//! identity is its concept index. The encoder adds a fixed signal:
//!
//! ```text
//! pe[p, 2i]     = sin(p / 10000^(2i/D)) / sqrt(D)
//! pe[p, 2i + 1] = cos(p / 10000^(2i/D)) / sqrt(D)
//! ```

use candle_core::{Device, Tensor};

use crate::layers::Dropout;
use crate::{HashCoreError, Result};

/// Fixed (non-trainable) additive position signal for LND sequences
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// `[max_len, 1, D]`
    table: Tensor,
    max_len: usize,
    dim: usize,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(dim: usize, max_len: usize, dropout: f32, device: &Device) -> Result<Self> {
        if dim == 0 || !dim.is_multiple_of(2) {
            return Err(HashCoreError::Config(format!(
                "Position encoding dimension must be even, got {}",
                dim
            )));
        }

        let scale = 1.0 / (dim as f32).sqrt();
        let mut table = vec![0.0f32; max_len * dim];
        for p in 0..max_len {
            for i in 0..dim / 2 {
                let freq = 1.0 / 10000.0_f32.powf(2.0 * i as f32 / dim as f32);
                let angle = p as f32 * freq;
                table[p * dim + 2 * i] = angle.sin() * scale;
                table[p * dim + 2 * i + 1] = angle.cos() * scale;
            }
        }

        let table = Tensor::from_vec(table, (max_len, 1, dim), device)
            .map_err(|e| HashCoreError::Tensor(format!("position table failed: {}", e)))?;

        Ok(Self {
            table,
            max_len,
            dim,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// The stored `[max_len, 1, D]` table
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// `x: [L, N, D]` with `L <= max_len`; longer sequences are rejected.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (seq_len, _batch, dim) = x.dims3().map_err(|e| {
            HashCoreError::Shape(format!("position encoding expects LND input: {}", e))
        })?;
        if dim != self.dim {
            return Err(HashCoreError::Shape(format!(
                "position encoding width is {}, got {}",
                self.dim, dim
            )));
        }
        if seq_len > self.max_len {
            return Err(HashCoreError::Shape(format!(
                "sequence length {} exceeds position encoding capacity {}",
                seq_len, self.max_len
            )));
        }

        let pe = self
            .table
            .narrow(0, 0, seq_len)
            .map_err(|e| HashCoreError::Tensor(format!("position narrow failed: {}", e)))?;
        let x = x
            .broadcast_add(&pe)
            .map_err(|e| HashCoreError::Tensor(format!("position add failed: {}", e)))?;
        self.dropout.forward(&x, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_table_values() {
        let pe = PositionalEncoding::new(4, 3, 0.0, &Device::Cpu).unwrap();
        let table = pe.table().squeeze(1).unwrap().to_vec2::<f32>().unwrap();
        let s = 0.5f32; // 1 / sqrt(4)

        // position 0: sin(0) = 0, cos(0) = 1
        assert_eq!(table[0], vec![0.0, s, 0.0, s]);

        // position 1, channel pair 0: freq 1; pair 1: freq 1/100
        assert!((table[1][0] - 1.0f32.sin() * s).abs() < 1e-6);
        assert!((table[1][1] - 1.0f32.cos() * s).abs() < 1e-6);
        assert!((table[1][2] - 0.01f32.sin() * s).abs() < 1e-6);
        assert!((table[1][3] - 0.01f32.cos() * s).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic_on_zero_input() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 4, 0.0, &device).unwrap();
        let zeros = Tensor::zeros((3, 2, 8), DType::F32, &device).unwrap();

        let a = pe.forward(&zeros, false).unwrap();
        let b = pe.forward(&zeros, false).unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );

        // Same signal for every sample in the batch
        let per_sample = a.transpose(0, 1).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(per_sample[0], per_sample[1]);
    }

    #[test]
    fn test_rejects_sequences_longer_than_capacity() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 4, 0.0, &device).unwrap();
        let x = Tensor::zeros((5, 1, 8), DType::F32, &device).unwrap();

        assert!(matches!(pe.forward(&x, false), Err(HashCoreError::Shape(_))));
    }

    #[test]
    fn test_rejects_odd_dim() {
        assert!(PositionalEncoding::new(7, 4, 0.0, &Device::Cpu).is_err());
    }
}

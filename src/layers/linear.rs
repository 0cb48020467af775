//! Affine projection with `Var` parameters

use candle_core::{Device, Tensor, Var};

use super::{join_name, Parameterized};
use crate::{HashCoreError, Result};

/// `y = x W + b`, weight stored as `[in_dim, out_dim]`
///
/// Accepts inputs of any rank whose last axis is `in_dim`; leading axes are
/// flattened for the matmul and restored afterwards.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Var,
    bias: Option<Var>,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    /// Uniform init in `±1/sqrt(in_dim)` for weight and bias.
    pub fn new(in_dim: usize, out_dim: usize, with_bias: bool, device: &Device) -> Result<Self> {
        let bound = 1.0f32 / (in_dim.max(1) as f32).sqrt();

        let weight = Var::from_tensor(
            &Tensor::rand(-bound, bound, (in_dim, out_dim), device)
                .map_err(|e| HashCoreError::Tensor(format!("Failed to create linear weight: {}", e)))?,
        )
        .map_err(|e| HashCoreError::Tensor(format!("Failed to create linear weight var: {}", e)))?;

        let bias = if with_bias {
            Some(
                Var::from_tensor(
                    &Tensor::rand(-bound, bound, out_dim, device).map_err(|e| {
                        HashCoreError::Tensor(format!("Failed to create linear bias: {}", e))
                    })?,
                )
                .map_err(|e| {
                    HashCoreError::Tensor(format!("Failed to create linear bias var: {}", e))
                })?,
            )
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    /// Build from explicit tensors: weight `[in_dim, out_dim]`, bias `[out_dim]`.
    pub fn from_tensors(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        let (in_dim, out_dim) = weight
            .dims2()
            .map_err(|e| HashCoreError::Shape(format!("linear weight must be 2D: {}", e)))?;

        let bias = match bias {
            Some(b) => {
                if b.dims() != [out_dim] {
                    return Err(HashCoreError::Shape(format!(
                        "linear bias must be [{}], got {:?}",
                        out_dim,
                        b.dims()
                    )));
                }
                Some(Var::from_tensor(b)?)
            }
            None => None,
        };

        Ok(Self {
            weight: Var::from_tensor(weight)?,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Weight variable, `[in_dim, out_dim]`
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Bias variable, if any
    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        match dims.last() {
            Some(&last) if last == self.in_dim => {}
            _ => {
                return Err(HashCoreError::Shape(format!(
                    "linear expects last dim {}, got {:?}",
                    self.in_dim, dims
                )))
            }
        }

        let rows: usize = dims[..dims.len() - 1].iter().product();
        let flat = x
            .reshape((rows, self.in_dim))
            .map_err(|e| HashCoreError::Tensor(format!("linear flatten failed: {}", e)))?;

        let mut y = flat
            .matmul(self.weight.as_tensor())
            .map_err(|e| HashCoreError::Tensor(format!("linear matmul failed: {}", e)))?;

        if let Some(b) = &self.bias {
            y = y
                .broadcast_add(b.as_tensor())
                .map_err(|e| HashCoreError::Tensor(format!("linear add bias failed: {}", e)))?;
        }

        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.out_dim;
        }
        y.reshape(out_dims)
            .map_err(|e| HashCoreError::Tensor(format!("linear unflatten failed: {}", e)))
    }
}

impl Parameterized for Linear {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
        if let Some(b) = &self.bias {
            out.push((join_name(prefix, "bias"), b.clone()));
        }
    }
}

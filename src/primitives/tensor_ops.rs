//! Core Tensor Operations
//!
//! Device selection plus the masking and normalization helpers used across
//! the concept pipeline.
//!
//! ## Device selection
//!
//! Set `CONCEPT_HASH_NO_GPU=1` to force CPU even when the crate is built with
//! the `metal` or `cuda` feature:
//!
//! ```bash
//! export CONCEPT_HASH_NO_GPU=1
//! ```

use crate::{HashCoreError, Result};
use candle_core::{Device, Tensor, D};
use tracing::info;

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
///
/// Set `CONCEPT_HASH_NO_GPU=1` to force CPU-only mode.
pub fn gpu_disabled() -> bool {
    std::env::var("CONCEPT_HASH_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `CONCEPT_HASH_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("Using CPU device (CONCEPT_HASH_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

// ============================================================================
// Masking
// ============================================================================

/// Replace entries of `x` where `mask` is nonzero with `value`.
///
/// `mask` must be a `u8` tensor broadcastable to `x`.
pub fn masked_fill(x: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let mask = mask
        .broadcast_as(x.shape())
        .map_err(|e| HashCoreError::Tensor(format!("masked_fill broadcast failed: {}", e)))?;
    let fill = Tensor::full(value, x.shape(), x.device())
        .map_err(|e| HashCoreError::Tensor(format!("masked_fill full failed: {}", e)))?;
    mask.where_cond(&fill, x)
        .map_err(|e| HashCoreError::Tensor(format!("masked_fill where failed: {}", e)))
}

/// Replace every NaN entry with 0.0.
///
/// NaN is the only value that compares unequal to itself.
pub fn nan_to_zero(x: &Tensor) -> Result<Tensor> {
    let is_nan = x
        .ne(x)
        .map_err(|e| HashCoreError::Tensor(format!("nan_to_zero compare failed: {}", e)))?;
    masked_fill(x, &is_nan, 0.0)
}

// ============================================================================
// Normalization
// ============================================================================

/// L2 normalize a tensor along the last dimension
///
/// Norms are floored at 1e-12 so all-zero rows stay zero instead of NaN.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x
        .sqr()
        .map_err(|e| HashCoreError::Tensor(format!("l2_normalize sqr failed: {}", e)))?
        .sum_keepdim(D::Minus1)
        .map_err(|e| HashCoreError::Tensor(format!("l2_normalize sum failed: {}", e)))?
        .sqrt()
        .map_err(|e| HashCoreError::Tensor(format!("l2_normalize sqrt failed: {}", e)))?
        .clamp(1e-12f32, f32::MAX)
        .map_err(|e| HashCoreError::Tensor(format!("l2_normalize clamp failed: {}", e)))?;

    x.broadcast_div(&norm)
        .map_err(|e| HashCoreError::Tensor(format!("l2_normalize div failed: {}", e)))
}

// ============================================================================
// Shape contracts
// ============================================================================

/// Check that `x` has exactly `expected.len()` dims and that every `Some`
/// entry of `expected` matches.
///
/// `name` and `layout` (e.g. "LND") are only used for the error message.
pub fn expect_dims(
    x: &Tensor,
    name: &str,
    layout: &str,
    expected: &[Option<usize>],
) -> Result<()> {
    let dims = x.dims();
    let matches = dims.len() == expected.len()
        && dims
            .iter()
            .zip(expected.iter())
            .all(|(actual, want)| want.is_none_or(|w| w == *actual));

    if matches {
        return Ok(());
    }

    let wanted: Vec<String> = expected
        .iter()
        .map(|d| d.map(|v| v.to_string()).unwrap_or_else(|| "_".into()))
        .collect();
    Err(HashCoreError::Shape(format!(
        "{} must be {} with shape [{}], got {:?}",
        name,
        layout,
        wanted.join(", "),
        dims
    )))
}

//! Model checkpoints
//!
//! Parameters are written as one safetensors file keyed by the dotted names
//! from [`Parameterized::named_vars`]. A JSON sidecar next to it
//! (`<path>.meta.json`) records where the weights came from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::layers::Parameterized;
use crate::model::HashingModel;
use crate::{HashCoreError, Result, Tensor};

/// Sidecar metadata stored next to a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub name: String,
    /// Crate version that wrote the checkpoint
    pub version: String,
    /// [`crate::config::HashConfig::fingerprint`] of the saved model
    pub config_fingerprint: String,
    pub param_count: usize,
    pub trained_at: DateTime<Utc>,
}

/// `model.safetensors` -> `model.safetensors.meta.json`
pub fn metadata_path(path: impl AsRef<Path>) -> PathBuf {
    let mut s = path.as_ref().as_os_str().to_owned();
    s.push(".meta.json");
    PathBuf::from(s)
}

/// Write every parameter of `model` to `path` plus the metadata sidecar.
pub fn save(model: &HashingModel, path: impl AsRef<Path>, name: &str) -> Result<CheckpointMetadata> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(HashCoreError::Io)?;
    }

    let named = model.named_vars();

    // Host copies must outlive the views that borrow them
    let mut data_store: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::with_capacity(named.len());
    for (param, var) in &named {
        let data: Vec<f32> = var
            .as_tensor()
            .flatten_all()
            .map_err(|e| HashCoreError::Tensor(format!("flatten {} failed: {}", param, e)))?
            .to_vec1()
            .map_err(|e| HashCoreError::Tensor(format!("read {} failed: {}", param, e)))?;
        data_store.push((param.clone(), var.as_tensor().dims().to_vec(), data));
    }

    let mut views: HashMap<String, TensorView> = HashMap::with_capacity(data_store.len());
    for (param, shape, data) in &data_store {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(data))
            .map_err(|e| HashCoreError::Serialization(format!("{}: {}", param, e)))?;
        views.insert(param.clone(), view);
    }

    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| HashCoreError::Serialization(e.to_string()))?;

    let metadata = CheckpointMetadata {
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        config_fingerprint: model.config().fingerprint()?,
        param_count: model.param_count(),
        trained_at: Utc::now(),
    };
    let metadata_json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| HashCoreError::Serialization(e.to_string()))?;
    std::fs::write(metadata_path(path), metadata_json).map_err(HashCoreError::Io)?;

    info!(
        path = %path.display(),
        tensors = named.len(),
        params = metadata.param_count,
        "checkpoint saved"
    );
    Ok(metadata)
}

/// Read the metadata sidecar of a checkpoint.
pub fn load_metadata(path: impl AsRef<Path>) -> Result<CheckpointMetadata> {
    let json = std::fs::read_to_string(metadata_path(path)).map_err(HashCoreError::Io)?;
    serde_json::from_str(&json).map_err(|e| HashCoreError::Serialization(e.to_string()))
}

/// Restore every parameter of `model` from `path` in place.
///
/// Every model parameter must be present with the same shape. Extra tensors
/// in the file are ignored.
pub fn load(model: &HashingModel, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();

    let fingerprint = model.config().fingerprint()?;
    match load_metadata(path) {
        Ok(meta) if meta.config_fingerprint != fingerprint => {
            warn!(
                path = %path.display(),
                checkpoint = %meta.name,
                "checkpoint was saved with a different configuration"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "checkpoint metadata unavailable"),
    }

    let data = std::fs::read(path).map_err(HashCoreError::Io)?;
    let tensors =
        SafeTensors::deserialize(&data).map_err(|e| HashCoreError::Serialization(e.to_string()))?;

    // Validate and rebuild everything before touching the model so a bad
    // checkpoint leaves it unchanged
    let named = model.named_vars();
    let mut restored = Vec::with_capacity(named.len());
    for (param, var) in &named {
        let view = tensors.tensor(param).map_err(|e| {
            HashCoreError::Serialization(format!("missing parameter {}: {}", param, e))
        })?;
        if view.dtype() != Dtype::F32 {
            return Err(HashCoreError::Serialization(format!(
                "parameter {} has dtype {:?}, expected F32",
                param,
                view.dtype()
            )));
        }
        if view.shape() != var.as_tensor().dims() {
            return Err(HashCoreError::Serialization(format!(
                "parameter {} has shape {:?}, model expects {:?}",
                param,
                view.shape(),
                var.as_tensor().dims()
            )));
        }

        let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        let tensor = Tensor::from_vec(values, view.shape(), var.as_tensor().device())
            .map_err(|e| HashCoreError::Tensor(format!("rebuild {} failed: {}", param, e)))?;
        restored.push((param, var, tensor));
    }

    for (param, var, tensor) in &restored {
        var.set(tensor)
            .map_err(|e| HashCoreError::Tensor(format!("restore {} failed: {}", param, e)))?;
    }

    debug!(path = %path.display(), tensors = named.len(), "checkpoint loaded");
    Ok(())
}

impl HashingModel {
    /// See [`save`]
    pub fn save(&self, path: impl AsRef<Path>, name: &str) -> Result<CheckpointMetadata> {
        save(self, path, name)
    }

    /// See [`load`]
    pub fn load_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        load(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashConfig;
    use crate::Device;

    fn config() -> HashConfig {
        HashConfig::default()
            .with_embed_dim(8)
            .with_k_bits(4)
            .with_transformer_layers(1)
            .with_transformer_heads(2)
            .with_top_k_label(2)
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("concept_hash_ckpt_{}_{}", std::process::id(), name))
            .join("model.safetensors")
    }

    #[test]
    fn test_round_trip() {
        let device = Device::Cpu;
        let path = temp_path("round_trip");

        let saved = HashingModel::new(&config(), &device).unwrap();
        let meta = saved.save(&path, "unit").unwrap();
        assert_eq!(meta.param_count, saved.param_count());
        assert_eq!(load_metadata(&path).unwrap(), meta);

        let restored = HashingModel::new(&config(), &device).unwrap();
        restored.load_weights(&path).unwrap();

        let tokens = Tensor::randn(0.0f32, 1.0, (3, 2, 8), &device).unwrap();
        let cls = Tensor::randn(0.0f32, 1.0, (2, 8), &device).unwrap();
        let a = saved.forward_image(&tokens, &cls, false).unwrap().image.unwrap();
        let b = restored.forward_image(&tokens, &cls, false).unwrap().image.unwrap();
        assert_eq!(
            a.token_hash.to_vec2::<f32>().unwrap(),
            b.token_hash.to_vec2::<f32>().unwrap()
        );
        assert_eq!(
            a.pooled_hash.to_vec2::<f32>().unwrap(),
            b.pooled_hash.to_vec2::<f32>().unwrap()
        );

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let path = temp_path("shape_mismatch");

        let saved = HashingModel::new(&config(), &device).unwrap();
        saved.save(&path, "small").unwrap();

        let wider = HashingModel::new(&config().with_embed_dim(16), &device).unwrap();
        assert!(matches!(
            wider.load_weights(&path),
            Err(HashCoreError::Serialization(_))
        ));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let device = Device::Cpu;
        let path = temp_path("missing_param");

        let saved = HashingModel::new(&config(), &device).unwrap();
        saved.save(&path, "no-mlp").unwrap();

        // Residual MLP parameters are not in the file
        let deeper = HashingModel::new(&config().with_res_mlp_layers(1), &device).unwrap();
        assert!(matches!(
            deeper.load_weights(&path),
            Err(HashCoreError::Serialization(_))
        ));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_failed_load_leaves_model_untouched() {
        let device = Device::Cpu;
        let path = temp_path("failed_load");

        let shallow = HashingModel::new(&config(), &device).unwrap();
        shallow.save(&path, "one-layer").unwrap();

        // Shared projection and first block match the file; the second block is missing
        let deeper = HashingModel::new(&config().with_transformer_layers(2), &device).unwrap();
        let snapshot = |m: &HashingModel| -> Vec<(String, Vec<f32>)> {
            m.named_vars()
                .into_iter()
                .map(|(n, v)| (n, v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
                .collect()
        };
        let before = snapshot(&deeper);

        assert!(matches!(
            deeper.load_weights(&path),
            Err(HashCoreError::Serialization(_))
        ));
        assert_eq!(snapshot(&deeper), before);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_metadata_path() {
        assert_eq!(
            metadata_path("ckpt/model.safetensors"),
            PathBuf::from("ckpt/model.safetensors.meta.json")
        );
    }
}

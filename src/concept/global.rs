//! Global concept learning
//!
//! A single bias-free `D → K` projection defines the concept space. The same
//! instance scores pooled vectors (giving the pooled hash code) and every
//! token of a sequence (giving per-token concept scores), for both
//! modalities.

use candle_core::{Device, Tensor, Var};
use tracing::debug;

use super::ResidualMlp;
use crate::config::{Activation, HashConfig};
use crate::layers::{join_name, Linear, Parameterized};
use crate::Result;

/// Optional residual MLP followed by the shared concept projection and tanh
#[derive(Debug, Clone)]
pub struct GlobalConceptLearner {
    mlp: Option<ResidualMlp>,
    concept_embedding: Linear,
}

impl GlobalConceptLearner {
    pub fn new(
        dim: usize,
        k_concept: usize,
        res_mlp_layers: usize,
        activation: Activation,
        dropout: f32,
        device: &Device,
    ) -> Result<Self> {
        let mlp = if res_mlp_layers > 0 {
            Some(ResidualMlp::new(dim, res_mlp_layers, activation, dropout, device)?)
        } else {
            None
        };

        Ok(Self {
            mlp,
            concept_embedding: Linear::new(dim, k_concept, false, device)?,
        })
    }

    pub fn from_config(config: &HashConfig, device: &Device) -> Result<Self> {
        Self::new(
            config.embed_dim,
            config.k_bits,
            config.res_mlp_layers,
            config.activation,
            config.dropout,
            device,
        )
    }

    pub fn k_concept(&self) -> usize {
        self.concept_embedding.out_dim()
    }

    /// Concept projection weight `[D, K]`
    pub fn concept_weight(&self) -> &Var {
        self.concept_embedding.weight()
    }

    pub fn has_mlp(&self) -> bool {
        self.mlp.is_some()
    }

    /// `x: [..., D]` -> (features `[..., D]`, concept activations `[..., K]` in [-1, 1])
    ///
    /// Pooled `[N, D]` inputs and token `[L, N, D]` inputs go through the
    /// same weights; the projection is pointwise over leading axes.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        debug!(shape = ?x.dims(), "global concept learning");

        let features = match &self.mlp {
            Some(mlp) => mlp.forward(x, train)?,
            None => x.clone(),
        };
        let concepts = crate::primitives::tanh(&self.concept_embedding.forward(&features)?)?;
        Ok((features, concepts))
    }
}

impl Parameterized for GlobalConceptLearner {
    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        if let Some(mlp) = &self.mlp {
            mlp.collect_vars(&join_name(prefix, "mlp"), out);
        }
        self.concept_embedding
            .collect_vars(&join_name(prefix, "common_concept_embedding"), out);
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
    fn test_pooled_and_token_inputs_share_projection() {
        let gcl = GlobalConceptLearner::new(8, 4, 0, Activation::ReLU, 0.0, &device()).unwrap();
        let tokens = Tensor::randn(0.0f32, 1.0, (5, 2, 8), &device()).unwrap();

        let (feats, token_concepts) = gcl.forward(&tokens, false).unwrap();
        assert_eq!(feats.dims(), &[5, 2, 8]);
        assert_eq!(token_concepts.dims(), &[5, 2, 4]);

        // Token 3 scored on its own as a pooled vector gives the same concepts
        let pooled = tokens.get(3).unwrap();
        let (_, pooled_concepts) = gcl.forward(&pooled, false).unwrap();
        let a = pooled_concepts.to_vec2::<f32>().unwrap();
        let b = token_concepts.get(3).unwrap().to_vec2::<f32>().unwrap();
        for (ra, rb) in a.iter().zip(b.iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert!((va - vb).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_without_mlp_features_pass_through() {
        let gcl = GlobalConceptLearner::new(8, 4, 0, Activation::ReLU, 0.0, &device()).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (3, 8), &device()).unwrap();

        let (feats, concepts) = gcl.forward(&x, false).unwrap();
        assert_eq!(feats.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
        let vals = concepts.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| v.abs() <= 1.0));
        assert!(!gcl.has_mlp());
    }

    #[test]
    fn test_projection_has_no_bias() {
        let gcl = GlobalConceptLearner::new(8, 4, 0, Activation::ReLU, 0.0, &device()).unwrap();
        let zeros = Tensor::zeros((2, 8), DType::F32, &device()).unwrap();

        let (_, concepts) = gcl.forward(&zeros, false).unwrap();
        assert!(concepts.flatten_all().unwrap().to_vec1::<f32>().unwrap().iter().all(|v| *v == 0.0));
        assert_eq!(gcl.param_count(), 32);
    }

    #[test]
    fn test_with_mlp() {
        let gcl = GlobalConceptLearner::new(8, 4, 2, Activation::GELU, 0.0, &device()).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (3, 8), &device()).unwrap();

        let (feats, concepts) = gcl.forward(&x, false).unwrap();
        assert_eq!(feats.dims(), &[3, 8]);
        assert_eq!(concepts.dims(), &[3, 4]);
        assert!(gcl.has_mlp());

        let names: Vec<String> = gcl.named_vars().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"mlp.lns.1.weight".to_string()));
        assert!(names.contains(&"common_concept_embedding.weight".to_string()));
    }
}

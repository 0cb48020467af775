//! Concept learning and slot hashing
//!
//! ## Pipeline
//!
//! ```text
//! pooled [N, D] ──► GlobalConceptLearner ──► (features [N, D], concept code [N, K])
//!
//! tokens [L, N, D] ──► GlobalConceptLearner (shared) ──► scores [L, N, K] ──detach──┐
//!        │                                                                          ▼
//!        └─────────────────────────────────────────────► LocalizedTokenAggregation
//!                                                                  │ slots [K, N, D]
//!                                                                  ▼
//!                                        PositionalEncoding ─► SlotTransformer ─► BitwiseHashing
//!                                                                                    │
//!                                                                             hash [N, K]
//! ```
//!
//! The concept count and the hash length are the same number: slot `k`
//! feeds bit `k` only.
//!
//! ## Submodules
//!
//! - [`residual_mlp`]: optional pre-projection feature enrichment
//! - [`position`]: fixed sin/cos slot position signal
//! - [`hashing`]: per-bit linear + tanh head
//! - [`global`]: shared concept projection
//! - [`aggregation`]: top-k sparse token-to-slot aggregation
//! - [`local`]: aggregation → position → transformer → hashing

pub mod aggregation;
pub mod global;
pub mod hashing;
pub mod local;
pub mod position;
pub mod residual_mlp;

pub use aggregation::{AggregationOutput, LocalizedTokenAggregation};
pub use global::GlobalConceptLearner;
pub use hashing::BitwiseHashing;
pub use local::{LocalConceptOutput, LocalConceptTransformer};
pub use position::PositionalEncoding;
pub use residual_mlp::ResidualMlp;

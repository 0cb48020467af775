//! Tensor Primitives
//!
//! Core tensor operations and activation functions shared by every layer.
//!
//! ## Submodules
//!
//! - [`tensor_ops`]: Device selection, masking, NaN neutralization, L2 normalization
//! - [`activations`]: Activation functions (sigmoid, softmax, relu, gelu, tanh)

mod tensor_ops;
mod activations;

// Re-export all primitives at module level
pub use tensor_ops::*;
pub use activations::*;

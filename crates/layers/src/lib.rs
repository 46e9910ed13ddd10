//! Building blocks for transformer layers.
//!
//! Everything here is assembled from `candle_nn` primitives registered through a
//! [`candle_nn::VarBuilder`], so parameters land in the caller's `VarMap` under
//! stable dotted names.

pub mod activations;
pub mod block;
pub mod checks;
pub mod mlp;

pub use activations::ActivationKind;
pub use block::{BlockConfig, TransformerBlock};
pub use mlp::{FeedForward, FeedForwardConfig};

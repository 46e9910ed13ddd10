//! Additive masks shared by attention implementations.
//!
//! Masks have dtype [`MASK_DTYPE`] and broadcast against scores shaped
//! `[batch, num_heads, q_len, k_len]`. A `0.0` entry keeps the position.
//! Causal masks use `f32::NEG_INFINITY`; key padding uses the finite
//! [`PADDING_FILL`] so a query whose visible keys are all padding still gets a
//! well-defined softmax row instead of NaN.

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Additive value for padded keys.
pub const PADDING_FILL: f32 = -1e9;

pub use causal::build_causal_mask;
pub use padding::key_padding_mask_from_flags;

#[cfg(test)]
mod tests;

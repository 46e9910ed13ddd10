//! Self-attention primitives shared by the policy backbone and the
//! forward-prediction decoder.
//!
//! Inputs `Q`, `K` and `V` use the layout `[batch, n_heads, seq_len, head_dim]`
//! and share a dtype (bf16, f16 or f32). Scores are accumulated in `f32` and
//! the output matches the dtype of `Q`.
//!
//! Masks are additive: `0.0` keeps a position, negative values suppress it.
//! Causal structure is not implied by the kernel; callers that need it build a
//! mask with [`masks::build_causal_mask`] and, for padded sequences, add a key
//! mask from [`masks::key_padding_mask_from_flags`].

pub mod core;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use reference::ExactAttention;

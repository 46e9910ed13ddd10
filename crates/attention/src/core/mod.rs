//! Core traits and types shared across attention implementations.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q`, `k`, and `v` share the layout `[batch, n_heads, seq_len, head_dim]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, must broadcast to `[batch, n_heads, q_len, k_len]`;
///   the batch and head axes may be `1`.
/// * Dropout is controlled via [`Config::dropout_p`].
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

//! Builders for causal attention masks.

use candle_core::{DType, Device, Result, Tensor};

use super::MASK_DTYPE;

/// Construct a causal mask shaped `[batch, num_heads, q_len, k_len]`.
///
/// When `k_len > q_len`, queries align with the most recent `q_len` keys and
/// see the whole prefix.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len) as i64;
    let rows = Tensor::arange(offset, offset + q_len as i64, device)?.reshape((q_len, 1))?;
    let cols = Tensor::arange(0i64, k_len as i64, device)?.reshape((1, k_len))?;
    let future = cols.broadcast_gt(&rows)?;

    let blocked = Tensor::full(f32::NEG_INFINITY, (q_len, k_len), device)?;
    let open = Tensor::zeros((q_len, k_len), MASK_DTYPE, device)?;
    future
        .to_dtype(DType::U8)?
        .where_cond(&blocked, &open)?
        .reshape((1, 1, q_len, k_len))?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}

//! Key padding masks derived from 0/1 token flags.

use candle_core::{DType, Result, Tensor};

use super::{MASK_DTYPE, PADDING_FILL};

/// Turn a `(batch, k_len)` tensor of visibility flags into an additive mask
/// shaped `[batch, 1, 1, k_len]`.
///
/// Any non-zero flag keeps the key; zero flags receive [`PADDING_FILL`]. The
/// flags may use any numeric dtype.
pub fn key_padding_mask_from_flags(flags: &Tensor) -> Result<Tensor> {
    let (batch, k_len) = flags.dims2()?;
    let device = flags.device();
    let visible = flags.ne(0f64)?.to_dtype(DType::U8)?;
    let open = Tensor::zeros((batch, k_len), MASK_DTYPE, device)?;
    let blocked = Tensor::full(PADDING_FILL, (batch, k_len), device)?;
    visible
        .where_cond(&open, &blocked)?
        .reshape((batch, 1, 1, k_len))
}

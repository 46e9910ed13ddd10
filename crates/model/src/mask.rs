//! Token-level attention mask for the flattened sequence.
//!
//! The mask is a 0/1 `u32` tensor shaped `(batch, time * total_per_step)`.
//! Content tokens inherit their step's validity flag; query tokens are always
//! 0 so no later token attends to them and the backbone treats them like
//! padding keys. They still sit in the causal sequence and read from the
//! content before them.

use candle_core::{DType, Tensor};

use crate::{
    error::{ModelError, Result},
    layout::TokenLayout,
};

/// Value written at every query-token position.
pub const QUERY_MASK_VALUE: u32 = 0;

pub struct AttentionMaskBuilder;

impl AttentionMaskBuilder {
    /// Reads `(batch, time)` or `(batch, time, 1)` validity into `(batch, time)`.
    /// Any non-zero entry counts as a real step.
    pub fn step_flags(step_validity: &Tensor) -> Result<Tensor> {
        let flags = match *step_validity.dims() {
            [_, _] => step_validity.clone(),
            [batch, time, 1] => step_validity.reshape((batch, time))?,
            _ => {
                return Err(ModelError::ShapeMismatch {
                    context: "step validity (batch, time[, 1])".to_string(),
                    expected: vec![],
                    actual: step_validity.dims().to_vec(),
                })
            }
        };
        Ok(flags.ne(0f64)?.to_dtype(DType::U32)?)
    }

    pub fn build(step_validity: &Tensor, layout: &TokenLayout) -> Result<Tensor> {
        let flags = Self::step_flags(step_validity)?;
        let (batch, time) = flags.dims2()?;
        let device = flags.device();

        let mut blocks = Vec::with_capacity(1 + layout.query_segments().count());
        blocks.push(
            flags
                .reshape((batch, time, 1))?
                .broadcast_as((batch, time, layout.content_tokens()))?
                .contiguous()?,
        );
        for segment in layout.query_segments() {
            blocks.push(Tensor::full(
                QUERY_MASK_VALUE,
                (batch, time, segment.len),
                device,
            )?);
        }

        let mask = Tensor::cat(&blocks, 2)?;
        Ok(mask.reshape((batch, layout.flattened_len(time)))?)
    }
}

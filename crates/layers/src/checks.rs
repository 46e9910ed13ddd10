//! Shape validation shared across layer components. Failures come back as
//! `candle_core::Error` so forward paths propagate them with `?`.

use candle_core::{Error, Result, Tensor};

/// Validates the `(batch, seq, hidden)` convention with a known hidden size
/// and returns `(batch, seq)`.
pub fn expect_batch_seq_hidden(
    context: &str,
    tensor: &Tensor,
    hidden: usize,
) -> Result<(usize, usize)> {
    match *tensor.dims() {
        [batch, seq, actual] if actual == hidden => Ok((batch, seq)),
        _ => Err(Error::Msg(format!(
            "{context}: expected (batch, seq, {hidden}) layout, got {:?}",
            tensor.dims()
        ))),
    }
}

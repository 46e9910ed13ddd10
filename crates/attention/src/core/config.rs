//! Run-time knobs for attention kernels.

use super::AttentionError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Dropout applied to attention probabilities. `None` keeps the
    /// computation deterministic, which is what inference callers want.
    pub dropout_p: Option<f32>,
}

impl Config {
    /// Builds a configuration from an optional dropout probability, folding
    /// `Some(0.0)` into `None`.
    pub fn with_dropout(dropout_p: Option<f32>) -> Result<Self, AttentionError> {
        match dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => Err(AttentionError::InvalidConfig {
                message: format!("dropout probability must be in [0, 1), got {p}"),
            }),
            Some(p) if p == 0.0 => Ok(Self { dropout_p: None }),
            other => Ok(Self { dropout_p: other }),
        }
    }
}

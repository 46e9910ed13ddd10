use thiserror::Error;

/// Failures raised while building or running the policy model.
///
/// Every variant aborts the current call; nothing is padded or truncated to
/// make shapes fit.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("shape mismatch for {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing modality embedding `{0}`")]
    MissingModality(&'static str),
    #[error("unsupported path: {0}")]
    UnsupportedPath(String),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl ModelError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

//! Distributional TD objective over the value head's quantiles.

use candle_core::{DType, Tensor};

use crate::{
    loss::{smooth_l1, to_runtime_error},
    TrainingError,
};

/// Quantile regression loss with a Huber kernel (κ = 1).
///
/// `current` is `(batch, n)` and `target` is `(batch, m)`. Quantile `i` of
/// `current` sits at cumulative probability `(i + 0.5) / n`. With
/// `sum_over_quantiles` the pairwise loss is summed over the current
/// quantiles before averaging; otherwise everything is averaged.
pub fn quantile_huber_loss(
    current: &Tensor,
    target: &Tensor,
    sum_over_quantiles: bool,
) -> Result<Tensor, TrainingError> {
    let (batch, n) = current.dims2().map_err(|_| {
        TrainingError::runtime(format!(
            "current quantiles must be (batch, n), got {:?}",
            current.dims()
        ))
    })?;
    let (target_batch, _) = target.dims2().map_err(|_| {
        TrainingError::runtime(format!(
            "target quantiles must be (batch, m), got {:?}",
            target.dims()
        ))
    })?;
    if target_batch != batch {
        return Err(TrainingError::runtime(format!(
            "quantile batch mismatch: current {batch}, target {target_batch}"
        )));
    }

    let device = current.device();
    let dtype = current.dtype();
    let tau = Tensor::arange(0u32, n as u32, device)
        .and_then(|t| t.to_dtype(dtype))
        .and_then(|t| t.affine(1.0 / n as f64, 0.5 / n as f64))
        .and_then(|t| t.reshape((1, n, 1)))
        .map_err(to_runtime_error)?;

    let pairwise = || -> candle_core::Result<Tensor> {
        let delta = target.unsqueeze(1)?.broadcast_sub(&current.unsqueeze(2)?)?;
        let huber = smooth_l1(&delta)?;
        let below = delta.lt(0f64)?.to_dtype(dtype)?;
        let weight = tau.broadcast_sub(&below)?.abs()?;
        let loss = (weight * huber)?;
        if sum_over_quantiles {
            loss.sum(1)?.mean_all()
        } else {
            loss.mean_all()
        }
    };
    pairwise().map_err(to_runtime_error)
}

/// `reward + (1 - terminated) · gamma · next`, with `next` detached.
///
/// `reward` and `terminated` are `(batch,)`; `next` is `(batch, n)`.
pub fn bootstrap_target(
    reward: &Tensor,
    terminated: &Tensor,
    next: &Tensor,
    gamma: f64,
) -> Result<Tensor, TrainingError> {
    let (batch, _) = next.dims2().map_err(to_runtime_error)?;
    if reward.dims() != [batch] || terminated.dims() != [batch] {
        return Err(TrainingError::runtime(format!(
            "reward {:?} and terminated {:?} must be ({batch},)",
            reward.dims(),
            terminated.dims()
        )));
    }

    let dtype = next.dtype();
    let build = || -> candle_core::Result<Tensor> {
        let reward = reward.to_dtype(dtype)?.reshape((batch, 1))?;
        let discount = terminated
            .to_dtype(dtype)?
            .affine(-gamma, gamma)?
            .reshape((batch, 1))?;
        next.detach().broadcast_mul(&discount)?.broadcast_add(&reward)
    };
    build().map_err(to_runtime_error)
}

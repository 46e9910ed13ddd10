use candle_core::{DType, Tensor, D};
use model::Predictions;

use crate::{config::LossConfig, TrainingError};

/// Per-element regression loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseLoss {
    Mse,
    /// Smooth L1 with beta 1.
    SmoothL1,
}

impl ElementwiseLoss {
    pub fn apply(&self, pred: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
        let diff = (pred - target)?;
        match self {
            ElementwiseLoss::Mse => diff.sqr(),
            ElementwiseLoss::SmoothL1 => smooth_l1(&diff),
        }
    }
}

/// `0.5·x²` inside `[-1, 1]`, `|x| - 0.5` outside.
pub(crate) fn smooth_l1(diff: &Tensor) -> candle_core::Result<Tensor> {
    let abs = diff.abs()?;
    let quadratic = abs.minimum(1f64)?;
    let linear = (&abs - &quadratic)?;
    quadratic.sqr()?.affine(0.5, 0.0)? + linear
}

/// Mean loss over the valid steps of `(batch, time, ...)` tensors.
///
/// With `skip_frame > 0` the prediction made at step `t` is scored against the
/// target at `t + skip_frame`, and the mask is taken from the target steps.
/// Returns a zero scalar when no step is valid.
pub fn masked_loss(
    pred: &Tensor,
    target: &Tensor,
    mask: &Tensor,
    skip_frame: usize,
    kind: ElementwiseLoss,
) -> Result<Tensor, TrainingError> {
    let dims = pred.dims();
    if dims.len() < 2 {
        return Err(TrainingError::runtime(
            "masked loss expects (batch, time, ...) predictions",
        ));
    }
    if target.dims() != dims {
        return Err(TrainingError::runtime(format!(
            "masked loss target shape {:?} does not match prediction {:?}",
            target.dims(),
            dims
        )));
    }
    let (batch, time) = (dims[0], dims[1]);
    if mask.dims() != [batch, time] {
        return Err(TrainingError::runtime(format!(
            "masked loss mask must be ({batch}, {time}), got {:?}",
            mask.dims()
        )));
    }

    let device = pred.device();
    if skip_frame >= time {
        return Tensor::zeros((), pred.dtype(), device).map_err(to_runtime_error);
    }
    let steps = time - skip_frame;

    let pred = pred.narrow(1, 0, steps).map_err(to_runtime_error)?;
    let target = target.narrow(1, skip_frame, steps).map_err(to_runtime_error)?;
    let mask = mask
        .narrow(1, skip_frame, steps)
        .and_then(|m| m.to_dtype(pred.dtype()))
        .map_err(to_runtime_error)?;

    let valid = mask
        .sum_all()
        .and_then(|s| s.to_dtype(DType::F32))
        .and_then(|s| s.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    if valid == 0.0 {
        return Tensor::zeros((), pred.dtype(), device).map_err(to_runtime_error);
    }

    let trailing: usize = dims[2..].iter().product();
    let mut mask_shape = vec![batch, steps];
    mask_shape.extend(std::iter::repeat(1).take(dims.len() - 2));

    let per_element = kind.apply(&pred, &target).map_err(to_runtime_error)?;
    per_element
        .broadcast_mul(&mask.reshape(mask_shape).map_err(to_runtime_error)?)
        .and_then(|l| l.sum_all())
        .and_then(|l| l.affine(1.0 / (valid as f64 * trailing as f64), 0.0))
        .map_err(to_runtime_error)
}

/// Normalizes every patch (last axis) to zero mean and unit variance.
pub fn normalize_patches(target: &Tensor) -> Result<Tensor, TrainingError> {
    let width = target.dim(D::Minus1).map_err(to_runtime_error)?;
    if width < 2 {
        return Err(TrainingError::runtime(
            "pixel normalization needs at least two values per patch",
        ));
    }
    let mean = target.mean_keepdim(D::Minus1).map_err(to_runtime_error)?;
    let centered = target.broadcast_sub(&mean).map_err(to_runtime_error)?;
    let var = centered
        .sqr()
        .and_then(|sq| sq.sum_keepdim(D::Minus1))
        .and_then(|sum| sum.affine(1.0 / (width - 1) as f64, 1e-6))
        .map_err(to_runtime_error)?;
    centered
        .broadcast_div(&var.sqrt().map_err(to_runtime_error)?)
        .map_err(to_runtime_error)
}

/// Supervision for one batch.
#[derive(Debug, Clone)]
pub struct Targets {
    /// `(batch, time, chunk, act_dim)`; the last action component is the
    /// gripper.
    pub actions: Tensor,
    /// `(batch, time, n_patch_latents, patch_pixels)` future patches.
    pub obs: Option<Tensor>,
    pub obs_hand: Option<Tensor>,
    /// `(batch, time)` step validity.
    pub mask: Tensor,
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

/// Scalar values of the loss terms that were computed, in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct LossMetrics {
    terms: Vec<(&'static str, f32)>,
}

impl LossMetrics {
    pub fn push(&mut self, name: &'static str, value: f32) {
        self.terms.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.terms
            .iter()
            .find(|(term, _)| *term == name)
            .map(|(_, value)| *value)
    }

    pub fn terms(&self) -> &[(&'static str, f32)] {
        &self.terms
    }
}

/// Reconstruction and behavior-cloning loss over the policy heads.
///
/// `total = rgb_static + rgb_gripper + arm_loss_ratio · action_arm +
/// action_gripper`; terms whose head did not run are left out.
#[derive(Debug, Clone)]
pub struct PolicyLoss {
    skip_frame: usize,
    arm_loss_ratio: f32,
    normalize_pixels: bool,
}

impl PolicyLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            skip_frame: config.skip_frame,
            arm_loss_ratio: config.arm_loss_ratio,
            normalize_pixels: !config.without_norm_pixel_loss,
        }
    }

    pub fn compute(
        &self,
        predictions: &Predictions,
        targets: &Targets,
    ) -> Result<LossOutput, TrainingError> {
        let mut metrics = LossMetrics::default();
        let mut total: Option<Tensor> = None;
        let mut add = |name: &'static str, term: Tensor, weight: f32| -> Result<(), TrainingError> {
            metrics.push(name, scalar(&term)?);
            let weighted = term.affine(weight as f64, 0.0).map_err(to_runtime_error)?;
            total = Some(match total.take() {
                Some(sum) => (sum + weighted).map_err(to_runtime_error)?,
                None => weighted,
            });
            Ok(())
        };

        for (name, pred, target) in [
            ("rgb_static", &predictions.obs, &targets.obs),
            ("rgb_gripper", &predictions.obs_hand, &targets.obs_hand),
        ] {
            let Some(pred) = pred else {
                continue;
            };
            let target = target.as_ref().ok_or_else(|| {
                TrainingError::runtime(format!("{name} prediction has no target"))
            })?;
            let target = if self.normalize_pixels {
                normalize_patches(target)?
            } else {
                target.clone()
            };
            let term = masked_loss(pred, &target, &targets.mask, self.skip_frame, ElementwiseLoss::Mse)?;
            add(name, term, 1.0)?;
        }

        if let (Some(arm), Some(gripper)) = (&predictions.arm, &predictions.gripper) {
            let act_dim = targets.actions.dim(D::Minus1).map_err(to_runtime_error)?;
            let arm_width = arm.dim(D::Minus1).map_err(to_runtime_error)?;
            if act_dim != arm_width + 1 {
                return Err(TrainingError::runtime(format!(
                    "action targets carry {act_dim} components, the arm head predicts {arm_width} plus gripper"
                )));
            }
            let arm_target = targets
                .actions
                .narrow(D::Minus1, 0, arm_width)
                .map_err(to_runtime_error)?;
            let gripper_target = targets
                .actions
                .narrow(D::Minus1, arm_width, 1)
                .map_err(to_runtime_error)?;

            let arm_term = masked_loss(arm, &arm_target, &targets.mask, 0, ElementwiseLoss::SmoothL1)?;
            add("action_arm", arm_term, self.arm_loss_ratio)?;
            let gripper_term =
                masked_loss(gripper, &gripper_target, &targets.mask, 0, ElementwiseLoss::SmoothL1)?;
            add("action_gripper", gripper_term, 1.0)?;
        }

        let loss = match total {
            Some(loss) => loss,
            None => Tensor::zeros((), DType::F32, targets.mask.device()).map_err(to_runtime_error)?,
        };
        metrics.push("policy", scalar(&loss)?);
        Ok(LossOutput { loss, metrics })
    }
}

pub(crate) fn scalar(tensor: &Tensor) -> Result<f32, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

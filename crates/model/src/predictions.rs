use candle_core::Tensor;

/// Per-head outputs of one forward call. A head that is disabled or not
/// routed yields `None`; the quantile head always runs.
#[derive(Debug, Clone)]
pub struct Predictions {
    /// `(batch, time, chunk, act_dim - 1)`.
    pub arm: Option<Tensor>,
    /// `(batch, time, chunk, 1)` gripper logits.
    pub gripper: Option<Tensor>,
    /// `(batch, time, n_patch_latents, patch_size² · channels)`.
    pub obs: Option<Tensor>,
    pub obs_hand: Option<Tensor>,
    /// `(batch, n_quantiles)`.
    pub quantiles: Tensor,
}

impl Predictions {
    /// Looks a head up by name (`arm`, `gripper`, `obs`, `obs_hand`,
    /// `quantiles`).
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        match name {
            "arm" => self.arm.as_ref(),
            "gripper" => self.gripper.as_ref(),
            "obs" => self.obs.as_ref(),
            "obs_hand" => self.obs_hand.as_ref(),
            "quantiles" => Some(&self.quantiles),
            _ => None,
        }
    }

    pub fn present(&self) -> Vec<&'static str> {
        ["arm", "gripper", "obs", "obs_hand", "quantiles"]
            .into_iter()
            .filter(|name| self.get(name).is_some())
            .collect()
    }
}

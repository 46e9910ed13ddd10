//! Position-wise feed-forward stacks.
//!
//! Inputs may carry any number of leading axes; the projections act on the
//! last one. `fc1` maps `hidden_size -> intermediate_size`, the activation runs,
//! and `fc2` maps to `output_size` (the hidden size for transformer MLPs,
//! something narrower for bottleneck heads).

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::activations::ActivationKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub output_size: usize,
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    /// Standard transformer MLP that returns to `hidden_size`.
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            output_size: hidden_size,
            activation,
        }
    }

    /// Two projections of width `width` with no non-linearity between them.
    pub fn bottleneck(hidden_size: usize, width: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size: width,
            output_size: width,
            activation: ActivationKind::Identity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    config: FeedForwardConfig,
}

impl FeedForward {
    pub fn new(vb: VarBuilder, config: FeedForwardConfig) -> Result<Self> {
        if config.hidden_size == 0 || config.intermediate_size == 0 || config.output_size == 0 {
            bail!("feed-forward widths must be non-zero: {config:?}");
        }
        let fc1 = linear(config.hidden_size, config.intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(config.intermediate_size, config.output_size, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2, config })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?;
        let hidden = self.config.activation.apply(&hidden)?;
        self.fc2.forward(&hidden)
    }
}

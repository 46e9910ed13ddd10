//! Learned per-timestep embedding shared by every token of a step.

use candle_core::{bail, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

/// A `(max_steps, hidden)` table; step `t` of a sequence receives row `t`.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    table: Embedding,
    max_steps: usize,
    hidden: usize,
}

impl TimestepEmbedding {
    /// Parameters live under `vb` as `weight`, initialised from `N(0, 1)`.
    pub fn new(vb: VarBuilder, max_steps: usize, hidden: usize) -> Result<Self> {
        if max_steps == 0 || hidden == 0 {
            bail!("timestep embedding requires max_steps > 0 and hidden > 0");
        }
        Ok(Self {
            table: embedding(max_steps, hidden, vb)?,
            max_steps,
            hidden,
        })
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Rows for steps `0..time`, shaped `(1, time, 1, hidden)` so they
    /// broadcast over batch and token axes.
    pub fn steps(&self, time: usize) -> Result<Tensor> {
        if time > self.max_steps {
            bail!(
                "sequence of {time} steps exceeds timestep table of {} rows",
                self.max_steps
            );
        }
        self.table
            .embeddings()
            .narrow(0, 0, time)?
            .reshape((1, time, 1, self.hidden))
    }

    /// Adds the timestep rows to `x` shaped `(batch, time, tokens, hidden)`.
    pub fn add_to(&self, x: &Tensor) -> Result<Tensor> {
        let (_, time, _, hidden) = x.dims4()?;
        if hidden != self.hidden {
            bail!(
                "timestep embedding hidden size {} does not match input {hidden}",
                self.hidden
            );
        }
        x.broadcast_add(&self.steps(time)?)
    }
}

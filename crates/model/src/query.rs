//! Learned query tokens, one table per prediction head.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::{
    config::ModelConfig,
    error::{ModelError, Result},
    heads::HeadSet,
    layout::SegmentKind,
};

const STANDARD_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 1.0,
};

/// Query tables. Only the heads present at construction get parameters.
///
/// The action-chunk table starts at zero so a freshly added chunk head
/// initially reproduces the single action query at every offset.
#[derive(Debug, Clone)]
pub struct QueryBank {
    action: Option<Tensor>,
    action_chunk: Option<Tensor>,
    obs: Option<Tensor>,
    obs_hand: Option<Tensor>,
    heads: HeadSet,
    hidden: usize,
}

/// Query segments broadcast to `(batch, time, width, hidden)`.
#[derive(Debug, Clone, Default)]
pub struct MaterializedQueries {
    pub action_chunk: Option<Tensor>,
    pub obs: Option<Tensor>,
    pub obs_hand: Option<Tensor>,
}

impl MaterializedQueries {
    pub fn for_segment(&self, kind: SegmentKind) -> Option<&Tensor> {
        match kind {
            SegmentKind::ActionQuery => self.action_chunk.as_ref(),
            SegmentKind::ObsQuery => self.obs.as_ref(),
            SegmentKind::ObsHandQuery => self.obs_hand.as_ref(),
            _ => None,
        }
    }
}

impl QueryBank {
    pub fn new(vb: VarBuilder, config: &ModelConfig, heads: &HeadSet) -> Result<Self> {
        let hidden = config.hidden_size;
        let obs_width = config.n_patch_latents + 1;

        let (action, action_chunk) = if heads.predicts_actions() {
            let action = vb.get_with_hints((1, hidden), "action_queries.weight", STANDARD_INIT)?;
            let chunk = vb.get_with_hints(
                (config.chunk_size, hidden),
                "action_chunk_queries.weight",
                Init::Const(0.0),
            )?;
            (Some(action), Some(chunk))
        } else {
            (None, None)
        };
        let obs = if heads.predicts_obs() {
            Some(vb.get_with_hints((obs_width, hidden), "obs_queries.weight", STANDARD_INIT)?)
        } else {
            None
        };
        let obs_hand = if heads.predicts_obs_hand() {
            Some(vb.get_with_hints(
                (obs_width, hidden),
                "obs_hand_queries.weight",
                STANDARD_INIT,
            )?)
        } else {
            None
        };

        Ok(Self {
            action,
            action_chunk,
            obs,
            obs_hand,
            heads: *heads,
            hidden,
        })
    }

    pub fn heads(&self) -> HeadSet {
        self.heads
    }

    pub fn materialize(&self, batch: usize, time: usize, heads: &HeadSet) -> Result<MaterializedQueries> {
        if !self.heads.contains(heads) {
            return Err(ModelError::configuration(format!(
                "requested heads {heads:?} exceed the query tables built for {:?}",
                self.heads
            )));
        }

        let mut queries = MaterializedQueries::default();
        if heads.predicts_actions() {
            if let (Some(action), Some(chunk)) = (&self.action, &self.action_chunk) {
                let summed = chunk.broadcast_add(action)?;
                queries.action_chunk = Some(self.broadcast(&summed, batch, time)?);
            }
        }
        if heads.predicts_obs() {
            if let Some(obs) = &self.obs {
                queries.obs = Some(self.broadcast(obs, batch, time)?);
            }
        }
        if heads.predicts_obs_hand() {
            if let Some(obs_hand) = &self.obs_hand {
                queries.obs_hand = Some(self.broadcast(obs_hand, batch, time)?);
            }
        }
        Ok(queries)
    }

    fn broadcast(&self, table: &Tensor, batch: usize, time: usize) -> Result<Tensor> {
        let width = table.dim(0)?;
        Ok(table
            .reshape((1, 1, width, self.hidden))?
            .broadcast_as((batch, time, width, self.hidden))?)
    }
}

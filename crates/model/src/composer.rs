//! Assembles the per-step token stack fed to the backbone.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use embedding::TimestepEmbedding;

use crate::{
    config::ModelConfig,
    error::{ModelError, Result},
    heads::{HeadSet, Routing},
    layout::TokenLayout,
    mask::AttentionMaskBuilder,
    modality::{Modality, ModalityEmbeddings},
    query::QueryBank,
};

/// Content modalities every call must provide.
const REQUIRED: [Modality; 4] = [
    Modality::Language,
    Modality::State,
    Modality::Patch,
    Modality::Obs,
];

/// Output of [`SequenceComposer::compose`].
#[derive(Debug, Clone)]
pub struct ComposedSequence {
    /// `(batch, time, total_per_step, hidden)`.
    pub stack: Tensor,
    /// `(batch, time * total_per_step)` 0/1 `u32`.
    pub attention_mask: Tensor,
    pub layout: TokenLayout,
    pub batch: usize,
    pub time: usize,
}

impl ComposedSequence {
    /// The stack as `(batch, time * total_per_step, hidden)`.
    pub fn flattened(&self) -> Result<Tensor> {
        let hidden = self.stack.dim(3)?;
        Ok(self
            .stack
            .reshape((self.batch, self.layout.flattened_len(self.time), hidden))?)
    }
}

#[derive(Debug, Clone)]
pub struct SequenceComposer {
    time_embedding: TimestepEmbedding,
    queries: QueryBank,
    config: ModelConfig,
}

impl SequenceComposer {
    pub fn new(vb: VarBuilder, config: &ModelConfig, heads: &HeadSet) -> Result<Self> {
        Ok(Self {
            time_embedding: TimestepEmbedding::new(
                vb.pp("embed_timestep"),
                config.seq_len,
                config.hidden_size,
            )?,
            queries: QueryBank::new(vb.clone(), config, heads)?,
            config: config.clone(),
        })
    }

    pub fn queries(&self) -> &QueryBank {
        &self.queries
    }

    pub fn compose(
        &self,
        embeddings: &ModalityEmbeddings,
        step_validity: &Tensor,
        routing: &Routing,
    ) -> Result<ComposedSequence> {
        if routing.use_hand_rgb || embeddings.iter().any(|(modality, _)| modality.is_hand()) {
            return Err(ModelError::UnsupportedPath(
                "hand-camera RGB tokens are not composed; disable use_hand_rgb and drop hand embeddings"
                    .to_string(),
            ));
        }

        let (batch, time) = self.check_inputs(embeddings, step_validity)?;
        let layout = TokenLayout::compute(&self.config.layout_spec(routing));
        log::debug!(
            "compose batch={batch} time={time} tokens_per_step={} [{}]",
            layout.total_per_step(),
            layout.describe()
        );

        let mut segments = Vec::with_capacity(layout.segments().len());
        for segment in layout.content_segments() {
            let modality = Modality::for_segment(segment.kind).ok_or_else(|| {
                ModelError::configuration(format!(
                    "segment {} has no modality",
                    segment.kind.name()
                ))
            })?;
            let tensor = embeddings
                .get(modality)
                .ok_or(ModelError::MissingModality(modality.name()))?;
            let tensor = if tensor.dim(1)? != time {
                tensor.broadcast_as((batch, time, segment.len, self.config.hidden_size))?
            } else {
                tensor.clone()
            };
            segments.push(self.time_embedding.add_to(&tensor)?);
        }

        let queries = self.queries.materialize(batch, time, &routing.heads)?;
        for segment in layout.query_segments() {
            let query = queries.for_segment(segment.kind).ok_or_else(|| {
                ModelError::configuration(format!(
                    "no query tokens materialized for segment {}",
                    segment.kind.name()
                ))
            })?;
            segments.push(query.clone());
        }

        let stack = Tensor::cat(&segments, 2)?;
        let expected = [batch, time, layout.total_per_step(), self.config.hidden_size];
        if stack.dims() != expected {
            return Err(ModelError::shape("composed stack", &expected, stack.dims()));
        }

        let attention_mask = AttentionMaskBuilder::build(step_validity, &layout)?;
        Ok(ComposedSequence {
            stack,
            attention_mask,
            layout,
            batch,
            time,
        })
    }

    /// Validates every embedding against the configuration before any tensor
    /// math runs and returns `(batch, time)`.
    fn check_inputs(
        &self,
        embeddings: &ModalityEmbeddings,
        step_validity: &Tensor,
    ) -> Result<(usize, usize)> {
        let hidden = self.config.hidden_size;
        let patch = embeddings
            .get(Modality::Patch)
            .ok_or(ModelError::MissingModality(Modality::Patch.name()))?;
        let (batch, time) = match *patch.dims() {
            [batch, time, _, _] => (batch, time),
            _ => {
                return Err(ModelError::shape(
                    "patch embeddings (batch, time, n_patch_latents, hidden)",
                    &[0, 0, self.config.n_patch_latents, hidden],
                    patch.dims(),
                ))
            }
        };
        if time != self.config.seq_len {
            return Err(ModelError::shape(
                "sequence length (time axis must equal seq_len)",
                &[self.config.seq_len],
                &[time],
            ));
        }

        for modality in REQUIRED {
            let tensor = embeddings
                .get(modality)
                .ok_or(ModelError::MissingModality(modality.name()))?;
            let count = modality.token_count(&self.config);
            let expected = [batch, time, count, hidden];
            let episode_level = [batch, 1, count, hidden];
            let accepted = tensor.dims() == expected
                || (modality == Modality::Language && tensor.dims() == episode_level);
            if !accepted {
                return Err(ModelError::shape(
                    format!("{} embeddings", modality.name()),
                    &expected,
                    tensor.dims(),
                ));
            }
        }

        let validity_ok = match *step_validity.dims() {
            [b, t] | [b, t, 1] => b == batch && t == time,
            _ => false,
        };
        if !validity_ok {
            return Err(ModelError::shape(
                "step validity",
                &[batch, time],
                step_validity.dims(),
            ));
        }
        Ok((batch, time))
    }
}

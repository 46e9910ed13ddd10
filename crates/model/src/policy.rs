//! The assembled policy: composer → input norm → backbone → decoder.

use candle_core::{Module, Tensor};
use candle_nn::{layer_norm, LayerNorm, VarBuilder};

use crate::{
    backbone::{Backbone, Gpt2Backbone},
    composer::SequenceComposer,
    config::ModelConfig,
    decoder::PredictionDecoder,
    error::{ModelError, Result},
    heads::{HeadSet, Routing},
    modality::ModalityEmbeddings,
    predictions::Predictions,
};

pub struct PolicyModel<B: Backbone = Gpt2Backbone> {
    config: ModelConfig,
    heads: HeadSet,
    composer: SequenceComposer,
    embed_ln: LayerNorm,
    backbone: B,
    decoder: PredictionDecoder,
}

impl PolicyModel<Gpt2Backbone> {
    /// Builds the model with a GPT-2 style backbone under `vb.pp("transformer")`.
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let backbone = Gpt2Backbone::new(vb.pp("transformer"), config.hidden_size, &config.backbone)?;
        Self::with_backbone(config, vb, backbone)
    }
}

impl<B: Backbone> PolicyModel<B> {
    pub fn with_backbone(config: ModelConfig, vb: VarBuilder, backbone: B) -> Result<Self> {
        config.validate()?;
        let heads = config.head_set()?;
        let composer = SequenceComposer::new(vb.clone(), &config, &heads)?;
        let embed_ln = layer_norm(config.hidden_size, 1e-5, vb.pp("embed_ln"))?;
        let decoder = PredictionDecoder::new(vb, &config, &heads)?;

        let routing = config.default_routing()?;
        let layout = crate::layout::TokenLayout::compute(&config.layout_spec(&routing));
        log::info!(
            "policy model: heads={:?} hand_rgb={} tokens_per_step={} (queries {}) sequence_len={}",
            heads,
            config.use_hand_rgb,
            layout.total_per_step(),
            layout.query_tokens(),
            layout.flattened_len(config.seq_len)
        );

        Ok(Self {
            config,
            heads,
            composer,
            embed_ln,
            backbone,
            decoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn heads(&self) -> HeadSet {
        self.heads
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    /// Routing used by [`PolicyModel::forward`].
    pub fn default_routing(&self) -> Routing {
        Routing::new(self.heads, self.config.use_hand_rgb)
    }

    pub fn forward(
        &self,
        embeddings: &ModalityEmbeddings,
        step_validity: &Tensor,
    ) -> Result<Predictions> {
        self.forward_routed(embeddings, step_validity, &self.default_routing())
    }

    /// Runs with an explicit routing. `routing.heads` must be a subset of the
    /// heads the model was built with.
    pub fn forward_routed(
        &self,
        embeddings: &ModalityEmbeddings,
        step_validity: &Tensor,
        routing: &Routing,
    ) -> Result<Predictions> {
        if !self.heads.contains(&routing.heads) {
            return Err(ModelError::configuration(format!(
                "routing requests {:?} but the model was built with {:?}",
                routing.heads, self.heads
            )));
        }

        let composed = self.composer.compose(embeddings, step_validity, routing)?;
        let inputs = self.embed_ln.forward(&composed.flattened()?)?;
        let outputs = self.backbone.forward(&inputs, &composed.attention_mask)?;
        if outputs.dims() != inputs.dims() {
            return Err(ModelError::shape("backbone output", inputs.dims(), outputs.dims()));
        }

        let hidden = outputs.reshape((
            composed.batch,
            composed.time,
            composed.layout.total_per_step(),
            self.config.hidden_size,
        ))?;
        self.decoder.decode(&hidden, &composed.layout)
    }
}

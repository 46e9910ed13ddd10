//! Decodes backbone output spans into per-head predictions.
//!
//! Spans are read at the offsets recorded in the [`TokenLayout`] of the call,
//! so the decoder and the composer cannot disagree about where a head's
//! query tokens sit.

use candle_core::{Module, Tensor};
use candle_nn::{layer_norm, linear, Init, LayerNorm, Linear, VarBuilder};
use embedding::sincos_2d;
use layers::{BlockConfig, FeedForward, FeedForwardConfig, TransformerBlock};

use crate::{
    config::ModelConfig,
    error::{ModelError, Result},
    heads::HeadSet,
    layout::{Segment, SegmentKind, TokenLayout},
    predictions::Predictions,
};

/// Shared bottleneck followed by separate arm and gripper projections.
#[derive(Debug, Clone)]
pub struct ActionHead {
    bottleneck: FeedForward,
    arm: Linear,
    gripper: Linear,
}

impl ActionHead {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let width = config.hidden_size / 2;
        Ok(Self {
            bottleneck: FeedForward::new(
                vb.pp("pred_act_mlps"),
                FeedForwardConfig::bottleneck(config.hidden_size, width),
            )?,
            arm: linear(width, config.act_dim - 1, vb.pp("pred_arm_act"))?,
            gripper: linear(width, 1, vb.pp("pred_gripper_act"))?,
        })
    }

    /// `span` is `(batch, time, chunk, hidden)`; returns `(arm, gripper)`.
    pub fn forward(&self, span: &Tensor) -> Result<(Tensor, Tensor)> {
        let latent = self.bottleneck.forward(span)?;
        Ok((self.arm.forward(&latent)?, self.gripper.forward(&latent)?))
    }
}

/// Masked-patch reconstruction decoder.
#[derive(Debug)]
pub struct ForwardHead {
    decoder_embed: Linear,
    mask_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<TransformerBlock>,
    norm: LayerNorm,
    pred: Linear,
    n_patch_latents: usize,
    hidden: usize,
}

impl ForwardHead {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let block_config = BlockConfig::vit(hidden, config.decoder.num_heads, config.decoder.mlp_ratio);
        let blocks = (0..config.decoder.depth)
            .map(|i| TransformerBlock::new(vb.pp(format!("decoder_blocks.{i}")), block_config.clone()))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            decoder_embed: linear(hidden, hidden, vb.pp("decoder_embed"))?,
            mask_token: vb.get_with_hints((1, 1, 1, hidden), "mask_token", Init::Const(0.0))?,
            pos_embed: sincos_2d(hidden, config.grid_size(), vb.device())?.to_dtype(vb.dtype())?,
            blocks,
            norm: layer_norm(hidden, 1e-5, vb.pp("decoder_norm"))?,
            pred: linear(hidden, config.patch_pixels(), vb.pp("decoder_pred"))?,
            n_patch_latents: config.n_patch_latents,
            hidden,
        })
    }

    /// Mask tokens with position codes, `(batch, time, grid², hidden)`.
    /// Built once per call and shared by the static and hand views.
    pub fn mask_tokens(&self, batch: usize, time: usize) -> Result<Tensor> {
        let patches = self.pos_embed.dim(0)?;
        let pos = self.pos_embed.reshape((1, 1, patches, self.hidden))?;
        Ok(self
            .mask_token
            .broadcast_add(&pos)?
            .broadcast_as((batch, time, patches, self.hidden))?)
    }

    /// `span` is the `(batch, time, n_patch_latents + 1, hidden)` observation
    /// query output. Returns `(batch, time, n_patch_latents, patch_pixels)`.
    pub fn forward(&self, span: &Tensor, mask_tokens: &Tensor) -> Result<Tensor> {
        let (batch, time, _, _) = span.dims4()?;
        let embedded = self.decoder_embed.forward(span)?;
        let tokens = Tensor::cat(&[&embedded, mask_tokens], 2)?;
        let len = tokens.dim(2)?;

        let mut hidden = tokens.reshape((batch * time, len, self.hidden))?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, None)?;
        }
        let pixels = self.pred.forward(&self.norm.forward(&hidden)?)?;
        let width = pixels.dim(2)?;
        Ok(pixels
            .reshape((batch, time, len, width))?
            .narrow(2, len - self.n_patch_latents, self.n_patch_latents)?)
    }
}

/// Distributional value head.
///
/// Each token is projected to `embed_dim`, tokens are averaged per step, and
/// the `time × embed_dim` vector of a sequence is mapped to the quantiles.
#[derive(Debug, Clone)]
pub struct QuantileHead {
    sample: Linear,
    qnet: Linear,
    seq_len: usize,
}

impl QuantileHead {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let embed = config.quantiles.embed_dim;
        Ok(Self {
            sample: linear(config.hidden_size, embed, vb.pp("q_sample"))?,
            qnet: linear(config.seq_len * embed, config.quantiles.n_quantiles, vb.pp("qnet"))?,
            seq_len: config.seq_len,
        })
    }

    /// `hidden` is `(batch, time, tokens, hidden)`; returns `(batch, n_quantiles)`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, time, _, _) = hidden.dims4()?;
        if time != self.seq_len {
            return Err(ModelError::shape(
                "quantile head time axis",
                &[self.seq_len],
                &[time],
            ));
        }
        let pooled = self.sample.forward(hidden)?.mean(2)?;
        let flat = pooled.reshape((batch, ()))?;
        Ok(self.qnet.forward(&flat)?)
    }
}

/// Cuts the query segments of `layout` out of `(batch, time, total, hidden)`.
pub fn query_spans(hidden: &Tensor, layout: &TokenLayout) -> Result<Vec<(Segment, Tensor)>> {
    layout
        .query_segments()
        .map(|segment| -> Result<(Segment, Tensor)> {
            let span = hidden.narrow(2, segment.start, segment.len)?.contiguous()?;
            Ok((*segment, span))
        })
        .collect()
}

#[derive(Debug)]
pub struct PredictionDecoder {
    action: Option<ActionHead>,
    forward: Option<ForwardHead>,
    quantile: QuantileHead,
    heads: HeadSet,
    hidden: usize,
}

impl PredictionDecoder {
    pub fn new(vb: VarBuilder, config: &ModelConfig, heads: &HeadSet) -> Result<Self> {
        let action = if heads.predicts_actions() {
            Some(ActionHead::new(vb.clone(), config)?)
        } else {
            None
        };
        let forward = if heads.predicts_obs() {
            Some(ForwardHead::new(vb.clone(), config)?)
        } else {
            None
        };
        Ok(Self {
            action,
            forward,
            quantile: QuantileHead::new(vb, config)?,
            heads: *heads,
            hidden: config.hidden_size,
        })
    }

    /// `hidden` is the backbone output re-expanded to
    /// `(batch, time, total_per_step, hidden)` for `layout`.
    pub fn decode(&self, hidden: &Tensor, layout: &TokenLayout) -> Result<Predictions> {
        let (batch, time) = match *hidden.dims() {
            [batch, time, tokens, width] if tokens == layout.total_per_step() && width == self.hidden => {
                (batch, time)
            }
            _ => {
                return Err(ModelError::shape(
                    "decoder input (batch, time, total_per_step, hidden)",
                    &[0, 0, layout.total_per_step(), self.hidden],
                    hidden.dims(),
                ))
            }
        };

        let mut predictions = Predictions {
            arm: None,
            gripper: None,
            obs: None,
            obs_hand: None,
            quantiles: self.quantile.forward(hidden)?,
        };
        let mut mask_tokens = None;

        for (segment, span) in query_spans(hidden, layout)? {
            match segment.kind {
                SegmentKind::ActionQuery => {
                    let head = self.action.as_ref().ok_or_else(|| self.missing(segment.kind))?;
                    let (arm, gripper) = head.forward(&span)?;
                    predictions.arm = Some(arm);
                    predictions.gripper = Some(gripper);
                }
                SegmentKind::ObsQuery | SegmentKind::ObsHandQuery => {
                    let head = self.forward.as_ref().ok_or_else(|| self.missing(segment.kind))?;
                    if segment.kind == SegmentKind::ObsHandQuery && !self.heads.predicts_obs_hand() {
                        return Err(self.missing(segment.kind));
                    }
                    if mask_tokens.is_none() {
                        mask_tokens = Some(head.mask_tokens(batch, time)?);
                    }
                    if let Some(tokens) = mask_tokens.as_ref() {
                        let obs = head.forward(&span, tokens)?;
                        if segment.kind == SegmentKind::ObsQuery {
                            predictions.obs = Some(obs);
                        } else {
                            predictions.obs_hand = Some(obs);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(predictions)
    }

    fn missing(&self, kind: SegmentKind) -> ModelError {
        ModelError::configuration(format!(
            "layout has a {} segment but the decoder was built for {:?}",
            kind.name(),
            self.heads
        ))
    }
}

//! Sequence-to-sequence backbones.
//!
//! A backbone receives the normalized flat stack `(batch, len, hidden)` and
//! the 0/1 token mask `(batch, len)` and returns a tensor of the same shape as
//! the stack.

use attention::masks::{build_causal_mask, key_padding_mask_from_flags};
use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};
use layers::{BlockConfig, TransformerBlock};

use crate::{
    config::BackboneConfig,
    error::{ModelError, Result},
};

pub trait Backbone {
    fn forward(&self, embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;
}

/// Returns its input. Useful for checking the composer and decoder agree on
/// offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityBackbone;

impl Backbone for IdentityBackbone {
    fn forward(&self, embeds: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        Ok(embeds.clone())
    }
}

/// GPT-2 style decoder over pre-computed input embeddings.
#[derive(Debug)]
pub struct Gpt2Backbone {
    wpe: Embedding,
    blocks: Vec<TransformerBlock>,
    ln_f: LayerNorm,
    max_positions: usize,
    hidden: usize,
}

impl Gpt2Backbone {
    pub fn new(vb: VarBuilder, hidden: usize, config: &BackboneConfig) -> Result<Self> {
        let mut block_config = BlockConfig::gpt2(hidden, config.n_heads, config.mlp_ratio);
        block_config.attn_dropout = config.attn_dropout;
        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlock::new(vb.pp(format!("h.{i}")), block_config.clone()))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            wpe: embedding(config.max_positions, hidden, vb.pp("wpe"))?,
            blocks,
            ln_f: layer_norm(hidden, 1e-5, vb.pp("ln_f"))?,
            max_positions: config.max_positions,
            hidden,
        })
    }
}

impl Backbone for Gpt2Backbone {
    fn forward(&self, embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (batch, len, hidden) = embeds.dims3()?;
        if hidden != self.hidden {
            return Err(ModelError::shape("backbone input", &[batch, len, self.hidden], embeds.dims()));
        }
        if len > self.max_positions {
            return Err(ModelError::shape(
                "backbone sequence length (max_positions)",
                &[self.max_positions],
                &[len],
            ));
        }
        if attention_mask.dims() != [batch, len] {
            return Err(ModelError::shape("backbone attention mask", &[batch, len], attention_mask.dims()));
        }

        let device = embeds.device();
        let positions = Tensor::arange(0u32, len as u32, device)?;
        let mut hidden_states = embeds.broadcast_add(&self.wpe.forward(&positions)?)?;

        let mask = build_causal_mask(device, 1, 1, len, len)?
            .broadcast_add(&key_padding_mask_from_flags(attention_mask)?)?
            .to_dtype(DType::F32)?;
        for block in &self.blocks {
            hidden_states = block.forward(&hidden_states, Some(&mask))?;
        }
        Ok(self.ln_f.forward(&hidden_states)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn config() -> BackboneConfig {
        BackboneConfig {
            n_layers: 2,
            n_heads: 2,
            mlp_ratio: 2,
            max_positions: 16,
            attn_dropout: None,
        }
    }

    #[test]
    fn output_matches_input_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Gpt2Backbone::new(vb.pp("transformer"), 8, &config())?;

        let embeds = Tensor::randn(0f32, 1.0, (2, 6, 8), &device)?;
        let mask = Tensor::new(&[[1u32, 1, 0, 1, 1, 0], [0, 0, 0, 0, 0, 0]], &device)?;
        let out = backbone.forward(&embeds, &mask)?;
        assert_eq!(out.dims(), &[2, 6, 8]);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    /// Max output difference at `observed` after adding noise to the inputs
    /// at `perturbed`.
    fn output_shift(
        flags: &[u32],
        perturbed: std::ops::Range<usize>,
        observed: std::ops::Range<usize>,
    ) -> Result<f32> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Gpt2Backbone::new(vb, 8, &config())?;

        let len = flags.len();
        let mask = Tensor::from_slice(flags, (1, len), &device)?;
        let embeds = Tensor::randn(0f32, 1.0, (1, len, 8), &device)?;
        let selector: Vec<f32> = (0..len)
            .map(|i| if perturbed.contains(&i) { 1.0 } else { 0.0 })
            .collect();
        let noise = Tensor::randn(0f32, 5.0, (1, len, 8), &device)?
            .broadcast_mul(&Tensor::from_vec(selector, (1, len, 1), &device)?)?;

        let clean = backbone.forward(&embeds, &mask)?;
        let noisy = backbone.forward(&(&embeds + noise)?, &mask)?;
        let width = observed.end - observed.start;
        let diff = (clean.narrow(1, observed.start, width)? - noisy.narrow(1, observed.start, width)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        Ok(diff)
    }

    #[test]
    fn query_tokens_are_invisible_to_later_tokens() -> Result<()> {
        let shift = output_shift(&[1, 1, 0, 0, 1, 1, 0, 0], 2..4, 4..6)?;
        assert!(shift < 1e-6, "content after the queries moved by {shift}");
        Ok(())
    }

    #[test]
    fn padded_steps_are_invisible_to_later_tokens() -> Result<()> {
        let shift = output_shift(&[1, 1, 0, 0, 0, 0, 0, 0, 1, 1, 0, 0], 4..8, 8..12)?;
        assert!(shift < 1e-6, "tokens after the padded step moved by {shift}");
        Ok(())
    }

    #[test]
    fn unmasked_content_is_attended() -> Result<()> {
        let shift = output_shift(&[1, 1, 0, 0, 1, 1, 0, 0], 0..2, 4..6)?;
        assert!(shift > 1e-4, "content should see earlier content, moved by {shift}");
        Ok(())
    }

    #[test]
    fn over_long_sequences_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Gpt2Backbone::new(vb, 8, &config())?;
        let embeds = Tensor::zeros((1, 17, 8), DType::F32, &device)?;
        let mask = Tensor::ones((1, 17), DType::U32, &device)?;
        assert!(matches!(
            backbone.forward(&embeds, &mask),
            Err(ModelError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn identity_returns_input() -> Result<()> {
        let embeds = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu)?;
        let mask = Tensor::ones((1, 3), DType::U32, &Device::Cpu)?;
        let out = IdentityBackbone.forward(&embeds, &mask)?;
        assert_eq!(out.to_vec3::<f32>()?, embeds.to_vec3::<f32>()?);
        Ok(())
    }
}

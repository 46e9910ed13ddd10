//! Pre-norm transformer block: `x + attn(ln1(x))` then `x + mlp(ln2(x))`.
//!
//! The same block serves the GPT-2 style backbone (tanh GELU, causal plus
//! padding mask) and the ViT style forward-prediction decoder (erf GELU, no
//! mask).

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, VarBuilder};

use crate::{
    activations::ActivationKind,
    checks::expect_batch_seq_hidden,
    mlp::{FeedForward, FeedForwardConfig},
};

#[derive(Debug, Clone, PartialEq)]
pub struct BlockConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    pub activation: ActivationKind,
    pub qkv_bias: bool,
    pub norm_eps: f64,
    pub attn_dropout: Option<f32>,
}

impl BlockConfig {
    pub fn vit(hidden_size: usize, num_heads: usize, mlp_ratio: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            mlp_ratio,
            activation: ActivationKind::Gelu,
            qkv_bias: true,
            norm_eps: 1e-5,
            attn_dropout: None,
        }
    }

    pub fn gpt2(hidden_size: usize, num_heads: usize, mlp_ratio: usize) -> Self {
        Self {
            activation: ActivationKind::GeluTanh,
            ..Self::vit(hidden_size, num_heads, mlp_ratio)
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }
}

#[derive(Debug)]
pub struct TransformerBlock {
    norm1: LayerNorm,
    qkv: Linear,
    proj: Linear,
    norm2: LayerNorm,
    mlp: FeedForward,
    attention: ExactAttention,
    attention_config: AttentionConfig,
    config: BlockConfig,
}

impl TransformerBlock {
    pub fn new(vb: VarBuilder, config: BlockConfig) -> Result<Self> {
        if config.num_heads == 0 || config.hidden_size % config.num_heads != 0 {
            bail!(
                "hidden size {} must be divisible by num_heads {}",
                config.hidden_size,
                config.num_heads
            );
        }
        if config.mlp_ratio == 0 {
            bail!("mlp_ratio must be greater than zero");
        }
        let hidden = config.hidden_size;
        let qkv = if config.qkv_bias {
            linear(hidden, 3 * hidden, vb.pp("attn.qkv"))?
        } else {
            linear_no_bias(hidden, 3 * hidden, vb.pp("attn.qkv"))?
        };
        let mlp_config =
            FeedForwardConfig::new(hidden, hidden * config.mlp_ratio, config.activation);
        let attention_config = AttentionConfig::with_dropout(config.attn_dropout)?;

        Ok(Self {
            norm1: layer_norm(hidden, config.norm_eps, vb.pp("norm1"))?,
            qkv,
            proj: linear(hidden, hidden, vb.pp("attn.proj"))?,
            norm2: layer_norm(hidden, config.norm_eps, vb.pp("norm2"))?,
            mlp: FeedForward::new(vb.pp("mlp"), mlp_config)?,
            attention: ExactAttention::new(),
            attention_config,
            config,
        })
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    /// `x` is `(batch, seq, hidden)`; `mask` is an additive mask broadcastable
    /// to `[batch, heads, seq, seq]`.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq) = expect_batch_seq_hidden("transformer block", x, self.config.hidden_size)?;
        let heads = self.config.num_heads;
        let head_dim = self.config.head_dim();

        let qkv = self
            .qkv
            .forward(&self.norm1.forward(x)?)?
            .reshape((batch, seq, 3, heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attended = self
            .attention
            .attend(&q, &k, &v, mask, &self.attention_config)?
            .transpose(1, 2)?
            .reshape((batch, seq, self.config.hidden_size))?;
        let x = (x + self.proj.forward(&attended)?)?;

        let mlp_out = self.mlp.forward(&self.norm2.forward(&x)?)?;
        x + mlp_out
    }
}

use serde::{Deserialize, Serialize};

use crate::{
    error::{ModelError, Result},
    heads::{HeadSet, Routing},
    layout::LayoutSpec,
};

/// High-level configuration for assembling the policy model.
///
/// Deserializes with every field optional; missing fields take the defaults
/// below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub state_dim: usize,
    pub act_dim: usize,
    pub hidden_size: usize,
    /// Steps per sequence; also the size of the learned time table.
    pub seq_len: usize,
    /// Future actions predicted per step.
    pub chunk_size: usize,
    /// Resampled visual latents per view and step.
    pub n_patch_latents: usize,
    pub patch_size: usize,
    pub image_size: usize,
    pub image_channels: usize,
    pub use_hand_rgb: bool,
    pub act_pred: bool,
    pub fwd_pred: bool,
    pub fwd_pred_hand: bool,
    pub decoder: DecoderConfig,
    pub quantiles: QuantileConfig,
    pub backbone: BackboneConfig,
}

/// Forward-prediction decoder stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantileConfig {
    pub n_quantiles: usize,
    pub embed_dim: usize,
}

/// GPT-2 style backbone hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub mlp_ratio: usize,
    pub max_positions: usize,
    pub attn_dropout: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            state_dim: 7,
            act_dim: 7,
            hidden_size: 384,
            seq_len: 10,
            chunk_size: 10,
            n_patch_latents: 9,
            patch_size: 16,
            image_size: 224,
            image_channels: 3,
            use_hand_rgb: false,
            act_pred: true,
            fwd_pred: true,
            fwd_pred_hand: false,
            decoder: DecoderConfig::default(),
            quantiles: QuantileConfig::default(),
            backbone: BackboneConfig::default(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            num_heads: 16,
            mlp_ratio: 4,
        }
    }
}

impl Default for QuantileConfig {
    fn default() -> Self {
        Self {
            n_quantiles: 200,
            embed_dim: 64,
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            n_layers: 12,
            n_heads: 12,
            mlp_ratio: 4,
            max_positions: 1024,
            attn_dropout: None,
        }
    }
}

impl ModelConfig {
    /// Checks every structural constraint and reports all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("state_dim", self.state_dim),
            ("hidden_size", self.hidden_size),
            ("seq_len", self.seq_len),
            ("chunk_size", self.chunk_size),
            ("n_patch_latents", self.n_patch_latents),
            ("patch_size", self.patch_size),
            ("image_channels", self.image_channels),
            ("quantiles.n_quantiles", self.quantiles.n_quantiles),
            ("quantiles.embed_dim", self.quantiles.embed_dim),
            ("backbone.max_positions", self.backbone.max_positions),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }

        if self.act_dim < 2 {
            errors.push(format!(
                "act_dim must be at least 2 (arm + gripper), got {}",
                self.act_dim
            ));
        }
        if self.hidden_size % 2 != 0 {
            errors.push(format!(
                "hidden_size must be even for the action bottleneck, got {}",
                self.hidden_size
            ));
        }
        if self.patch_size > 0 && self.image_size % self.patch_size != 0 {
            errors.push(format!(
                "image_size {} must be divisible by patch_size {}",
                self.image_size, self.patch_size
            ));
        }
        if self.image_size < self.patch_size {
            errors.push("image_size must cover at least one patch".to_string());
        }
        if self.fwd_pred && self.hidden_size % 4 != 0 {
            errors.push(format!(
                "hidden_size must be a multiple of 4 for the 2d position table, got {}",
                self.hidden_size
            ));
        }
        if self.fwd_pred {
            check_heads(
                &mut errors,
                "decoder",
                self.hidden_size,
                self.decoder.num_heads,
                self.decoder.mlp_ratio,
            );
        }
        check_heads(
            &mut errors,
            "backbone",
            self.hidden_size,
            self.backbone.n_heads,
            self.backbone.mlp_ratio,
        );
        if let Some(p) = self.backbone.attn_dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push("backbone.attn_dropout must be in [0, 1)".to_string());
            }
        }
        if let Err(err) = self.head_set() {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Configuration(errors.join("; ")))
        }
    }

    pub fn head_set(&self) -> Result<HeadSet> {
        HeadSet::from_flags(self.act_pred, self.fwd_pred, self.fwd_pred_hand)
    }

    /// Routing that runs every constructed head with the configured views.
    pub fn default_routing(&self) -> Result<Routing> {
        Ok(Routing::new(self.head_set()?, self.use_hand_rgb))
    }

    pub fn layout_spec(&self, routing: &Routing) -> LayoutSpec {
        LayoutSpec {
            routing: *routing,
            n_patch_latents: self.n_patch_latents,
            chunk_size: self.chunk_size,
        }
    }

    /// Side of the decoder's square patch grid.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Pixel values reconstructed per patch.
    pub fn patch_pixels(&self) -> usize {
        self.patch_size * self.patch_size * self.image_channels
    }
}

fn check_heads(errors: &mut Vec<String>, label: &str, hidden: usize, heads: usize, ratio: usize) {
    if heads == 0 || hidden % heads != 0 {
        errors.push(format!(
            "hidden_size {hidden} must be divisible by {label}.num_heads {heads}"
        ));
    }
    if ratio == 0 {
        errors.push(format!("{label}.mlp_ratio must be greater than zero"));
    }
}

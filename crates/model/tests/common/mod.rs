#![allow(dead_code)]

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model::{
    BackboneConfig, DecoderConfig, Modality, ModalityEmbeddings, ModelConfig, QuantileConfig,
};

pub fn small_config() -> ModelConfig {
    ModelConfig {
        state_dim: 7,
        act_dim: 7,
        hidden_size: 16,
        seq_len: 3,
        chunk_size: 2,
        n_patch_latents: 2,
        patch_size: 4,
        image_size: 8,
        image_channels: 3,
        use_hand_rgb: false,
        act_pred: true,
        fwd_pred: true,
        fwd_pred_hand: false,
        decoder: DecoderConfig {
            depth: 1,
            num_heads: 2,
            mlp_ratio: 2,
        },
        quantiles: QuantileConfig {
            n_quantiles: 5,
            embed_dim: 4,
        },
        backbone: BackboneConfig {
            n_layers: 1,
            n_heads: 2,
            mlp_ratio: 2,
            max_positions: 64,
            attn_dropout: None,
        },
    }
}

pub fn var_builder(varmap: &VarMap) -> VarBuilder<'static> {
    VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
}

pub fn random_embeddings(config: &ModelConfig, batch: usize) -> Result<ModalityEmbeddings> {
    let device = Device::Cpu;
    let mut set = ModalityEmbeddings::new();
    for modality in [
        Modality::Language,
        Modality::State,
        Modality::Patch,
        Modality::Obs,
    ] {
        let shape = (
            batch,
            config.seq_len,
            modality.token_count(config),
            config.hidden_size,
        );
        set.insert(modality, Tensor::randn(0f32, 1.0, shape, &device)?);
    }
    Ok(set)
}

/// Every token of a modality carries the constant `tag(modality)`.
pub fn tag(modality: Modality) -> f32 {
    (modality as usize + 1) as f32
}

pub fn tagged_embeddings(config: &ModelConfig, batch: usize) -> Result<ModalityEmbeddings> {
    let device = Device::Cpu;
    let mut set = ModalityEmbeddings::new();
    for modality in [
        Modality::Language,
        Modality::State,
        Modality::Patch,
        Modality::Obs,
    ] {
        let shape = (
            batch,
            config.seq_len,
            modality.token_count(config),
            config.hidden_size,
        );
        set.insert(modality, Tensor::full(tag(modality), shape, &device)?);
    }
    Ok(set)
}

pub fn all_valid(batch: usize, time: usize) -> Result<Tensor> {
    Tensor::ones((batch, time, 1), DType::F32, &Device::Cpu)
}

/// Overwrites a registered parameter with a constant.
pub fn fill_var(varmap: &VarMap, name: &str, value: f32) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let var = data
        .get(name)
        .unwrap_or_else(|| panic!("parameter {name} not registered"));
    let filled = Tensor::full(value, var.shape(), var.device())?;
    var.set(&filled)
}

pub fn distinct_values(tensor: &Tensor) -> Result<Vec<f32>> {
    let mut values = tensor.flatten_all()?.to_vec1::<f32>()?;
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup();
    Ok(values)
}

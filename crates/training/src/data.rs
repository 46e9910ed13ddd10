//! Batches of pre-embedded observations with their supervision.

use candle_core::{DType, Device, Tensor};
use model::{Modality, ModalityEmbeddings, ModelConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::DataConfig,
    loss::{to_runtime_error, Targets},
    TrainingError,
};

/// Observation one step after the batch, used for the TD bootstrap.
#[derive(Debug, Clone)]
pub struct NextObservation {
    pub embeddings: ModalityEmbeddings,
    pub validity: Tensor,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub embeddings: ModalityEmbeddings,
    /// `(batch, time)` step validity.
    pub validity: Tensor,
    pub targets: Targets,
    /// `(batch,)`.
    pub reward: Tensor,
    /// `(batch,)`, 1 where the episode ended.
    pub terminated: Tensor,
    pub next: Option<NextObservation>,
}

impl Batch {
    pub fn size(&self) -> Result<usize, TrainingError> {
        self.validity.dim(0).map_err(to_runtime_error)
    }
}

pub trait BatchSource {
    /// `Ok(None)` once the source is exhausted.
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError>;
}

impl BatchSource for std::vec::IntoIter<Batch> {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError> {
        Ok(self.next())
    }
}

/// Deterministic random batches shaped for a [`ModelConfig`].
///
/// Every row has a valid prefix of random length; targets follow the heads
/// the configuration enables.
pub struct SyntheticBatches {
    config: ModelConfig,
    batch_size: usize,
    with_next: bool,
    terminal_probability: f64,
    remaining: Option<usize>,
    rng: StdRng,
    device: Device,
}

impl SyntheticBatches {
    pub fn new(
        config: &ModelConfig,
        data: &DataConfig,
        seed: u64,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        if data.batch_size == 0 {
            return Err(TrainingError::initialization(
                "synthetic batches need batch_size > 0",
            ));
        }
        Ok(Self {
            config: config.clone(),
            batch_size: data.batch_size,
            with_next: data.with_next_observation,
            terminal_probability: data.terminal_probability,
            remaining: None,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        })
    }

    /// Stops after `batches` batches.
    pub fn with_limit(mut self, batches: usize) -> Self {
        self.remaining = Some(batches);
        self
    }

    fn uniform(&mut self, shape: &[usize], low: f32, high: f32) -> Result<Tensor, TrainingError> {
        let count = shape.iter().product();
        let values: Vec<f32> = (0..count).map(|_| self.rng.gen_range(low..high)).collect();
        Tensor::from_vec(values, shape, &self.device).map_err(to_runtime_error)
    }

    fn embeddings(&mut self) -> Result<ModalityEmbeddings, TrainingError> {
        let mut set = ModalityEmbeddings::new();
        for modality in Modality::ALL {
            if modality.is_hand() {
                continue;
            }
            let shape = [
                self.batch_size,
                self.config.seq_len,
                modality.token_count(&self.config),
                self.config.hidden_size,
            ];
            set.insert(modality, self.uniform(&shape, -1.0, 1.0)?);
        }
        Ok(set)
    }

    fn validity(&mut self) -> Result<Tensor, TrainingError> {
        let time = self.config.seq_len;
        let mut flags = Vec::with_capacity(self.batch_size * time);
        for _ in 0..self.batch_size {
            let valid = self.rng.gen_range(1..=time);
            flags.extend((0..time).map(|t| if t < valid { 1f32 } else { 0.0 }));
        }
        Tensor::from_vec(flags, (self.batch_size, time), &self.device).map_err(to_runtime_error)
    }

    fn targets(&mut self, mask: &Tensor) -> Result<Targets, TrainingError> {
        let (b, t) = (self.batch_size, self.config.seq_len);
        let chunk = self.config.chunk_size;
        let act_dim = self.config.act_dim;

        let arm = self.uniform(&[b, t, chunk, act_dim - 1], -1.0, 1.0)?;
        let gripper_values: Vec<f32> = (0..b * t * chunk)
            .map(|_| if self.rng.gen_bool(0.5) { 1.0 } else { 0.0 })
            .collect();
        let gripper = Tensor::from_vec(gripper_values, (b, t, chunk, 1), &self.device)
            .map_err(to_runtime_error)?;
        let actions = Tensor::cat(&[&arm, &gripper], 3).map_err(to_runtime_error)?;

        let patches = [b, t, self.config.n_patch_latents, self.config.patch_pixels()];
        let obs = if self.config.fwd_pred {
            Some(self.uniform(&patches, 0.0, 1.0)?)
        } else {
            None
        };
        let obs_hand = if self.config.fwd_pred_hand {
            Some(self.uniform(&patches, 0.0, 1.0)?)
        } else {
            None
        };

        Ok(Targets {
            actions,
            obs,
            obs_hand,
            mask: mask.clone(),
        })
    }

    fn flags(&mut self, probability: f64) -> Result<Tensor, TrainingError> {
        let values: Vec<f32> = (0..self.batch_size)
            .map(|_| if self.rng.gen_bool(probability) { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(values, self.batch_size, &self.device).map_err(to_runtime_error)
    }

    pub fn generate(&mut self) -> Result<Batch, TrainingError> {
        let embeddings = self.embeddings()?;
        let validity = self.validity()?;
        let targets = self.targets(&validity)?;
        let reward = self.uniform(&[self.batch_size], 0.0, 1.0)?;
        let terminated = self.flags(self.terminal_probability)?;
        let next = if self.with_next {
            let embeddings = self.embeddings()?;
            let validity = self.validity()?;
            Some(NextObservation {
                embeddings,
                validity,
            })
        } else {
            None
        };

        Ok(Batch {
            embeddings,
            validity,
            targets,
            reward,
            terminated,
            next,
        })
    }
}

impl BatchSource for SyntheticBatches {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError> {
        match self.remaining {
            Some(0) => return Ok(None),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        self.generate().map(Some)
    }
}

/// Converts 0/1 validity to `f32`, accepting `(batch, time)` or
/// `(batch, time, 1)`.
pub fn validity_mask(validity: &Tensor) -> Result<Tensor, TrainingError> {
    let flat = match *validity.dims() {
        [_, _] => validity.clone(),
        [batch, time, 1] => validity.reshape((batch, time)).map_err(to_runtime_error)?,
        _ => {
            return Err(TrainingError::runtime(format!(
                "validity must be (batch, time[, 1]), got {:?}",
                validity.dims()
            )))
        }
    };
    flat.ne(0f64)
        .and_then(|m| m.to_dtype(DType::F32))
        .map_err(to_runtime_error)
}

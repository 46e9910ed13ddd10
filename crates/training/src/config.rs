use model::{ModelConfig, ModelError};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.validate() {
            errors.push(format!("model: {err}"));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.data.terminal_probability) {
            errors.push("data.terminal_probability must be in [0, 1]".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.loss.skip_frame >= self.model.seq_len {
            errors.push(format!(
                "loss.skip_frame ({}) must be smaller than model.seq_len ({})",
                self.loss.skip_frame, self.model.seq_len
            ));
        }

        if self.loss.arm_loss_ratio < 0.0 {
            errors.push("loss.arm_loss_ratio must be >= 0".to_string());
        }

        if self.loss.td_weight < 0.0 {
            errors.push("loss.td_weight must be >= 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.loss.gamma) {
            errors.push("loss.gamma must be in [0, 1]".to_string());
        }

        if !(0.0 < self.loss.target_tau && self.loss.target_tau <= 1.0) {
            errors.push("loss.target_tau must be in (0, 1]".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if let Some(steps) = self.scheduler.total_steps {
            if steps == 0 {
                errors.push("scheduler.total_steps must be greater than 0".to_string());
            }
        }

        if let (Some(warmup), Some(total)) =
            (self.scheduler.warmup_steps, self.scheduler.total_steps)
        {
            if warmup > total {
                errors
                    .push("scheduler.warmup_steps cannot exceed scheduler.total_steps".to_string());
            }
        }

        if let Some(min_lr) = self.scheduler.min_lr {
            if min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
            if min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
            }
        }

        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_steps == 0 {
                errors.push("runtime.checkpoint.every_n_steps must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }

        if let Some(0) = self.runtime.evaluation.every_n_steps {
            errors.push("runtime.evaluation.every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.runtime.apply_base_path(base);
    }
}

/// Weights of the policy loss terms and the TD objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Frames skipped between an observation prediction and its target.
    #[serde(default = "default_skip_frame")]
    pub skip_frame: usize,
    #[serde(default = "default_arm_loss_ratio")]
    pub arm_loss_ratio: f32,
    #[serde(default)]
    pub without_norm_pixel_loss: bool,
    #[serde(default = "default_td_weight")]
    pub td_weight: f32,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Polyak factor for the target network.
    #[serde(default = "default_target_tau")]
    pub target_tau: f64,
    #[serde(default = "default_sum_over_quantiles")]
    pub sum_over_quantiles: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            skip_frame: default_skip_frame(),
            arm_loss_ratio: default_arm_loss_ratio(),
            without_norm_pixel_loss: false,
            td_weight: default_td_weight(),
            gamma: default_gamma(),
            target_tau: default_target_tau(),
            sum_over_quantiles: default_sum_over_quantiles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub warmup_steps: Option<usize>,
    /// Optimizer steps in a run; also the cosine period.
    #[serde(default)]
    pub total_steps: Option<usize>,
    #[serde(default)]
    pub min_lr: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_steps: None,
            total_steps: Some(default_total_steps()),
            min_lr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    Cosine,
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        Self::Cosine
    }
}

/// Synthetic batch generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attach a next observation to every batch for the TD bootstrap.
    #[serde(default = "default_true")]
    pub with_next_observation: bool,
    #[serde(default = "default_terminal_probability")]
    pub terminal_probability: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            with_next_observation: true,
            terminal_probability: default_terminal_probability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            log_every_n_steps: default_log_every_n_steps(),
            checkpoint: None,
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.directory, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_steps: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    #[serde(default)]
    pub max_batches: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_skip_frame() -> usize {
    3
}

fn default_arm_loss_ratio() -> f32 {
    100.0
}

fn default_td_weight() -> f32 {
    1.0
}

fn default_gamma() -> f64 {
    0.99
}

fn default_target_tau() -> f64 {
    0.005
}

fn default_sum_over_quantiles() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    5e-4
}

fn default_weight_decay() -> f64 {
    1e-5
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_total_steps() -> usize {
    1_000
}

fn default_batch_size() -> usize {
    4
}

fn default_terminal_probability() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_checkpoint_every() -> usize {
    100
}

fn default_tensorboard_flush_every_n() -> usize {
    10
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Model(ModelError),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Model(err) => write!(f, "model error: {}", err),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Model(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<ModelError> for TrainingError {
    fn from(value: ModelError) -> Self {
        TrainingError::Model(value)
    }
}

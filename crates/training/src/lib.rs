//! Training loop for the robot policy: behavior-cloning losses on actions and
//! future patches, a distributional TD objective against a Polyak-averaged
//! target network, checkpointing and TensorBoard logging.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod quantile;
pub mod scheduler;
pub mod target_network;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest, TrainingProgressSnapshot};
pub use config::{
    CheckpointConfig, DataConfig, EvaluationConfig, LearningRateSchedule, LoggingConfig,
    LossConfig, OptimizerConfig, RuntimeConfig, SchedulerConfig, TrainingConfig, TrainingError,
};
pub use data::{validity_mask, Batch, BatchSource, NextObservation, SyntheticBatches};
pub use logging::{Logger, ScalarGroup};
pub use loss::{ElementwiseLoss, LossMetrics, LossOutput, PolicyLoss, Targets};
pub use metrics::{EvaluationSummary, StepSnapshot, TrainingMetrics};
pub use quantile::{bootstrap_target, quantile_huber_loss};
pub use scheduler::{LRScheduler, Schedule};
pub use target_network::{copy_parameters, soft_update};
pub use trainer::{select_device, RunSummary, StepOutcome, Trainer};

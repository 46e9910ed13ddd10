use std::path::{Path, PathBuf};

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor, Var,
};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use model::PolicyModel;

use crate::{
    checkpoint::{self, LoadOutcome, RngSnapshot, SaveRequest, TrainingProgressSnapshot},
    config::CheckpointConfig,
    data::{validity_mask, Batch, BatchSource},
    logging::Logger,
    loss::{scalar, to_runtime_error, LossMetrics, PolicyLoss},
    metrics::{EvaluationMetrics, EvaluationSummary, TrainingMetrics},
    quantile::{bootstrap_target, quantile_huber_loss},
    scheduler::{LRScheduler, Schedule},
    target_network::{copy_parameters, soft_update},
    TrainingConfig, TrainingError,
};

/// Result of one optimizer step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: usize,
    pub loss: f32,
    pub td_loss: f32,
    pub learning_rate: f64,
    pub grad_norm: f64,
    pub metrics: LossMetrics,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub steps: usize,
    pub last_loss: Option<f32>,
    pub last_checkpoint: Option<PathBuf>,
}

struct StepLosses {
    total: Tensor,
    td: Tensor,
    metrics: LossMetrics,
}

/// Online/target policy pair trained with the behavior-cloning loss plus
/// the distributional TD objective.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    online_vars: VarMap,
    target_vars: VarMap,
    model: PolicyModel,
    target: PolicyModel,
    parameters: Vec<Var>,
    optimizer: AdamW,
    scheduler: Box<dyn LRScheduler>,
    loss: PolicyLoss,
    max_steps: Option<usize>,
    log_every: usize,
    progress: TrainingProgressSnapshot,
    rng_snapshot: RngSnapshot,
    checkpoint: Option<CheckpointConfig>,
    evaluation_source: Option<Box<dyn BatchSource>>,
    metrics: TrainingMetrics,
    logger: Logger,
}

impl Trainer {
    /// Builds on the best available accelerator, falling back to CPU.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        let device = select_device();
        Self::with_device(config, &device)
    }

    pub fn with_device(config: TrainingConfig, device: &Device) -> Result<Self, TrainingError> {
        config.validate()?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::debug!("device RNG not seeded: {}", err);
        }

        let online_vars = VarMap::new();
        let model = PolicyModel::new(
            config.model.clone(),
            VarBuilder::from_varmap(&online_vars, DType::F32, device),
        )?;
        let target_vars = VarMap::new();
        let target = PolicyModel::new(
            config.model.clone(),
            VarBuilder::from_varmap(&target_vars, DType::F32, device),
        )?;
        copy_parameters(&online_vars, &target_vars)?;

        let parameters = online_vars.all_vars();
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        log::info!(
            "optimizer will track {} tensor(s), {} value(s)",
            parameters.len(),
            parameters.iter().map(|var| var.elem_count()).sum::<usize>()
        );

        let opt = &config.optimizer;
        let optimizer = AdamW::new(
            parameters.clone(),
            ParamsAdamW {
                lr: opt.learning_rate,
                beta1: opt.beta1,
                beta2: opt.beta2,
                eps: opt.epsilon,
                weight_decay: opt.weight_decay,
            },
        )
        .map_err(|err| TrainingError::initialization(format!("failed to build AdamW: {err}")))?;

        let scheduler =
            Schedule::from_training_config(&config.scheduler, opt.learning_rate)?.build()?;

        let logger = Logger::from_config(&config.runtime.logging)?;

        Ok(Self {
            loss: PolicyLoss::new(&config.loss),
            max_steps: config.scheduler.total_steps,
            log_every: config.runtime.log_every_n_steps.max(1),
            progress: TrainingProgressSnapshot::default(),
            rng_snapshot: RngSnapshot {
                master_seed: config.runtime.seed,
            },
            checkpoint: config.runtime.checkpoint.clone(),
            evaluation_source: None,
            metrics: TrainingMetrics::new(),
            device: device.clone(),
            online_vars,
            target_vars,
            model,
            target,
            parameters,
            optimizer,
            scheduler,
            logger,
            config,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &PolicyModel {
        &self.model
    }

    pub fn online_vars(&self) -> &VarMap {
        &self.online_vars
    }

    pub fn target_vars(&self) -> &VarMap {
        &self.target_vars
    }

    pub fn progress(&self) -> &TrainingProgressSnapshot {
        &self.progress
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Batches used for periodic evaluation during [`Trainer::run`].
    pub fn set_evaluation_source(&mut self, source: Box<dyn BatchSource>) {
        self.evaluation_source = Some(source);
    }

    fn losses(&self, batch: &Batch) -> Result<StepLosses, TrainingError> {
        let predictions = self.model.forward(&batch.embeddings, &batch.validity)?;

        let mut targets = batch.targets.clone();
        targets.mask = validity_mask(&targets.mask)?;
        let policy = self.loss.compute(&predictions, &targets)?;

        let next_quantiles = match &batch.next {
            Some(next) => self.target.forward(&next.embeddings, &next.validity)?,
            None => self.target.forward(&batch.embeddings, &batch.validity)?,
        }
        .quantiles;
        let loss_cfg = &self.config.loss;
        let target_quantiles = bootstrap_target(
            &batch.reward,
            &batch.terminated,
            &next_quantiles,
            loss_cfg.gamma,
        )?;
        let td = quantile_huber_loss(
            &predictions.quantiles,
            &target_quantiles,
            loss_cfg.sum_over_quantiles,
        )?;

        let total = td
            .affine(loss_cfg.td_weight as f64, 0.0)
            .and_then(|weighted| weighted + &policy.loss)
            .map_err(to_runtime_error)?;

        let mut metrics = policy.metrics;
        metrics.push("td", scalar(&td)?);
        metrics.push("total", scalar(&total)?);
        Ok(StepLosses { total, td, metrics })
    }

    /// One forward/backward pass, optimizer update and target refresh.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutcome, TrainingError> {
        let StepLosses { total, td, metrics } = self.losses(batch)?;
        let loss = scalar(&total)?;
        if !loss.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite loss {loss} at step {}",
                self.progress.optimizer_step + 1
            )));
        }

        let mut grads = total.backward().map_err(to_runtime_error)?;
        let grad_norm = self.gradient_norm(&grads)?;
        if let Some(max_norm) = self.config.optimizer.max_grad_norm {
            self.clip_gradients(&mut grads, grad_norm, max_norm)?;
        }

        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads).map_err(to_runtime_error)?;
        soft_update(&self.online_vars, &self.target_vars, self.config.loss.target_tau)?;

        let samples = batch.size()? as u64;
        self.progress.optimizer_step += 1;
        self.progress.samples_seen += samples;
        let step = self.progress.optimizer_step;

        let snapshot = self
            .metrics
            .record_step(samples, loss as f64, grad_norm, &metrics);
        if step % self.log_every == 0 || step == 1 {
            self.logger.log_training_step(step, lr, &snapshot);
        }

        let checkpoint = self.maybe_checkpoint()?;
        self.maybe_evaluate()?;

        Ok(StepOutcome {
            step,
            loss,
            td_loss: scalar(&td)?,
            learning_rate: lr,
            grad_norm,
            metrics,
            checkpoint,
        })
    }

    pub fn run(&mut self, source: &mut dyn BatchSource) -> Result<RunSummary, TrainingError> {
        self.run_with_shutdown(source, || false)
    }

    /// Trains until `scheduler.total_steps`, an exhausted source, or
    /// `should_stop` returning true.
    pub fn run_with_shutdown<F>(
        &mut self,
        source: &mut dyn BatchSource,
        mut should_stop: F,
    ) -> Result<RunSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let mut summary = RunSummary::default();
        log::info!(
            "starting training on {:?} at step {} (max_steps={:?})",
            self.device,
            self.progress.optimizer_step,
            self.max_steps
        );

        loop {
            if should_stop() {
                log::info!("stop requested at step {}", self.progress.optimizer_step);
                break;
            }
            if let Some(limit) = self.max_steps {
                if self.progress.optimizer_step >= limit {
                    break;
                }
            }
            let Some(batch) = source.next_batch()? else {
                break;
            };

            let outcome = self.train_step(&batch)?;
            summary.steps += 1;
            summary.last_loss = Some(outcome.loss);
            if outcome.checkpoint.is_some() {
                summary.last_checkpoint = outcome.checkpoint;
            }
        }

        self.logger.flush();
        Ok(summary)
    }

    /// Averages the losses over up to `max_batches` batches without updating
    /// any parameter.
    pub fn evaluate(
        &mut self,
        source: &mut dyn BatchSource,
        max_batches: Option<usize>,
    ) -> Result<EvaluationSummary, TrainingError> {
        let mut metrics = EvaluationMetrics::default();
        let mut seen = 0usize;
        while max_batches.map_or(true, |limit| seen < limit) {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let losses = self.losses(&batch)?;
            metrics.update(
                scalar(&losses.total)? as f64,
                scalar(&losses.td)? as f64,
                batch.size()? as u64,
            );
            seen += 1;
        }
        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation source produced no batches"))
    }

    pub fn save_checkpoint(
        &self,
        directory: &Path,
    ) -> Result<checkpoint::CheckpointDescriptor, TrainingError> {
        checkpoint::save_checkpoint(SaveRequest {
            base_dir: directory,
            config: &self.config,
            online: &self.online_vars,
            target: &self.target_vars,
            progress: self.progress.clone(),
            rng: self.rng_snapshot.clone(),
            max_keep: self.checkpoint.as_ref().and_then(|cfg| cfg.max_keep),
        })
    }

    pub fn resume_from_latest(
        &mut self,
    ) -> Result<Option<checkpoint::CheckpointDescriptor>, TrainingError> {
        let Some(settings) = &self.checkpoint else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&settings.directory)? else {
            return Ok(None);
        };
        log::info!(
            "resuming from checkpoint {} (manifest step {})",
            descriptor.directory.display(),
            descriptor.manifest.progress.optimizer_step
        );
        let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
        self.apply_checkpoint(outcome)?;
        Ok(Some(descriptor))
    }

    pub fn resume_from_path(
        &mut self,
        directory: &Path,
    ) -> Result<checkpoint::CheckpointDescriptor, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        let manifest = outcome.manifest.clone();
        self.apply_checkpoint(outcome)?;
        Ok(checkpoint::CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        let LoadOutcome {
            manifest,
            online_weights_path,
            target_weights_path,
        } = outcome;

        checkpoint::apply_weights(&self.online_vars, &online_weights_path, &self.device)?;
        checkpoint::apply_weights(&self.target_vars, &target_weights_path, &self.device)?;

        // AdamW moments are not part of a checkpoint and restart from zero.
        self.scheduler.seek(manifest.progress.optimizer_step);
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());

        self.progress = manifest.progress;
        self.rng_snapshot = manifest.rng;
        Ok(())
    }

    fn gradient_norm(&self, grads: &GradStore) -> Result<f64, TrainingError> {
        let mut sum_squares = 0.0f64;
        for var in &self.parameters {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq = grad
                    .to_dtype(DType::F32)
                    .and_then(|g| g.sqr())
                    .and_then(|g| g.sum_all())
                    .and_then(|g| g.to_vec0::<f32>())
                    .map_err(to_runtime_error)? as f64;
                sum_squares += sq;
            }
        }
        Ok(sum_squares.sqrt())
    }

    fn clip_gradients(
        &self,
        grads: &mut GradStore,
        total_norm: f64,
        max_norm: f64,
    ) -> Result<(), TrainingError> {
        if total_norm <= max_norm {
            return Ok(());
        }
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in &self.parameters {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let clipped = (grad * clip_coef).map_err(to_runtime_error)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
        Ok(())
    }

    fn maybe_checkpoint(&mut self) -> Result<Option<PathBuf>, TrainingError> {
        let Some(settings) = &self.checkpoint else {
            return Ok(None);
        };
        if self.progress.optimizer_step % settings.every_n_steps != 0 {
            return Ok(None);
        }
        let directory = settings.directory.clone();
        let descriptor = self.save_checkpoint(&directory)?;
        log::info!(
            "checkpoint saved at step {} -> {}",
            self.progress.optimizer_step,
            descriptor.directory.display()
        );
        Ok(Some(descriptor.directory))
    }

    fn maybe_evaluate(&mut self) -> Result<(), TrainingError> {
        let Some(every) = self.config.runtime.evaluation.every_n_steps else {
            return Ok(());
        };
        if self.progress.optimizer_step % every != 0 {
            return Ok(());
        }
        let Some(mut source) = self.evaluation_source.take() else {
            return Ok(());
        };
        let max_batches = self.config.runtime.evaluation.max_batches;
        let result = self.evaluate(source.as_mut(), max_batches);
        self.evaluation_source = Some(source);

        let summary = result?;
        self.logger.log_evaluation(self.progress.optimizer_step, &summary);
        self.logger.flush();
        Ok(())
    }
}

/// Metal, then CUDA, then CPU. `CANDLE_FORCE_CPU` skips the accelerators.
pub fn select_device() -> Device {
    if std::env::var_os("CANDLE_FORCE_CPU").is_some() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Device::Cpu;
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => match preflight(&device) {
                Ok(()) => return device,
                Err(err) => log::warn!("metal preflight failed, falling back: {}", err),
            },
            Err(err) => log::warn!("failed to initialize metal device, falling back: {}", err),
        }
    }
    if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) if device.is_cuda() => return device,
            Ok(_) => {}
            Err(err) => log::warn!("cuda reported available but initialization failed: {}", err),
        }
    }
    log::info!("no GPU backend available; using CPU");
    Device::Cpu
}

/// Runs the ops the policy relies on once so a broken backend fails early.
fn preflight(device: &Device) -> candle_core::Result<()> {
    let a = Tensor::ones((2, 4), DType::F32, device)?;
    let b = Tensor::ones((4, 2), DType::F32, device)?;
    let _ = a.matmul(&b)?;

    let x = Tensor::randn(0f32, 1f32, (4, 16, 32), device)?;
    let scores = x.matmul(&x.transpose(1, 2)?)?;
    let _ = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(())
}

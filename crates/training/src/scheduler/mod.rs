use std::f64::consts::PI;

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one optimizer step and returns the rate to use for it.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
    /// Repositions the schedule after a resume.
    fn seek(&mut self, step: usize);
}

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Linear warmup, then cosine annealing from `base_lr` to `min_lr`.
    WarmupCosine {
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        min_lr: f64,
    },
    ConstantWithWarmup {
        base_lr: f64,
        warmup_steps: usize,
    },
}

impl Schedule {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        let total_steps = cfg.total_steps.ok_or_else(|| {
            TrainingError::initialization("scheduler requires scheduler.total_steps")
        })?;
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }

        let warmup_steps = cfg.warmup_steps.unwrap_or(0).min(total_steps);
        let min_lr = cfg.min_lr.unwrap_or(0.0);

        match cfg.strategy {
            config::LearningRateSchedule::Constant => Ok(Schedule::ConstantWithWarmup {
                base_lr,
                warmup_steps,
            }),
            config::LearningRateSchedule::Cosine => Ok(Schedule::WarmupCosine {
                base_lr,
                total_steps,
                warmup_steps,
                min_lr,
            }),
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            Schedule::WarmupCosine {
                base_lr,
                total_steps,
                warmup_steps,
                min_lr,
            } => Ok(Box::new(WarmupCosine::new(
                base_lr,
                min_lr,
                total_steps,
                warmup_steps,
            )?)),
            Schedule::ConstantWithWarmup {
                base_lr,
                warmup_steps,
            } => Ok(Box::new(ConstantWithWarmup::new(base_lr, warmup_steps)?)),
        }
    }
}

struct WarmupCosine {
    base_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupCosine {
    fn new(
        base_lr: f64,
        min_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        Ok(Self {
            base_lr,
            min_lr,
            total_steps: total_steps.max(1),
            warmup_steps,
            step: 0,
            current_lr: base_lr,
        })
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            return self.base_lr * progress;
        }

        if self.total_steps <= self.warmup_steps {
            return self.base_lr.max(self.min_lr);
        }

        let effective = step.saturating_sub(self.warmup_steps) as f64;
        let denom = (self.total_steps - self.warmup_steps).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

impl LRScheduler for WarmupCosine {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps_taken(&self) -> usize {
        self.step
    }

    fn seek(&mut self, step: usize) {
        self.step = step;
        self.current_lr = self.compute_lr(step.saturating_sub(1));
    }
}

struct ConstantWithWarmup {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl ConstantWithWarmup {
    fn new(base_lr: f64, warmup_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            step: 0,
            current_lr: base_lr,
        })
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            self.base_lr * progress
        } else {
            self.base_lr
        }
    }
}

impl LRScheduler for ConstantWithWarmup {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps_taken(&self) -> usize {
        self.step
    }

    fn seek(&mut self, step: usize) {
        self.step = step;
        self.current_lr = self.compute_lr(step.saturating_sub(1));
    }
}

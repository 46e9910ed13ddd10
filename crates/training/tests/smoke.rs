use std::collections::HashMap;

use candle_core::Device;
use candle_nn::VarMap;
use model::{BackboneConfig, DecoderConfig, ModelConfig, QuantileConfig};
use tempfile::tempdir;
use training::{
    config::{CheckpointConfig, DataConfig, LoggingConfig, RuntimeConfig, SchedulerConfig},
    BatchSource, SyntheticBatches, Trainer, TrainingConfig,
};

fn tiny_model() -> ModelConfig {
    ModelConfig {
        hidden_size: 16,
        seq_len: 4,
        chunk_size: 2,
        n_patch_latents: 2,
        patch_size: 2,
        image_size: 4,
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
            max_positions: 128,
            attn_dropout: None,
        },
        ..ModelConfig::default()
    }
}

fn tiny_config(checkpoint: Option<CheckpointConfig>, total_steps: usize) -> TrainingConfig {
    let mut config = TrainingConfig {
        model: tiny_model(),
        data: DataConfig {
            batch_size: 2,
            ..DataConfig::default()
        },
        scheduler: SchedulerConfig {
            total_steps: Some(total_steps),
            ..SchedulerConfig::default()
        },
        runtime: RuntimeConfig {
            checkpoint,
            logging: LoggingConfig {
                enable_stdout: false,
                ..LoggingConfig::default()
            },
            ..RuntimeConfig::default()
        },
        ..TrainingConfig::default()
    };
    config.loss.skip_frame = 1;
    config
}

fn batches(config: &TrainingConfig, seed: u64, limit: usize) -> SyntheticBatches {
    SyntheticBatches::new(&config.model, &config.data, seed, &Device::Cpu)
        .expect("synthetic batches")
        .with_limit(limit)
}

fn snapshot(varmap: &VarMap) -> HashMap<String, Vec<f32>> {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), values)
        })
        .collect()
}

fn max_abs_diff(a: &HashMap<String, Vec<f32>>, b: &HashMap<String, Vec<f32>>) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .flat_map(|(name, left)| {
            left.iter()
                .zip(&b[name])
                .map(|(x, y)| (x - y).abs())
                .collect::<Vec<_>>()
        })
        .fold(0.0, f32::max)
}

#[test]
fn smoke_training_checkpoint_resume() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let checkpoint = CheckpointConfig {
        directory: dir.path().join("checkpoints"),
        every_n_steps: 2,
        max_keep: Some(1),
    };
    let config = tiny_config(Some(checkpoint.clone()), 4);

    let mut trainer = Trainer::with_device(config.clone(), &Device::Cpu)?;
    let mut source = batches(&config, 5, 10);
    let summary = trainer.run(&mut source)?;

    assert_eq!(summary.steps, 4);
    assert!(summary.last_loss.is_some_and(f32::is_finite));
    assert_eq!(trainer.progress().optimizer_step, 4);
    assert_eq!(trainer.progress().samples_seen, 8);

    let last = summary.last_checkpoint.expect("checkpoint written at step 4");
    assert!(last.join("manifest.json").is_file());
    assert!(last.join("online.safetensors").is_file());
    assert!(last.join("target.safetensors").is_file());
    let kept = std::fs::read_dir(&checkpoint.directory)?.count();
    assert_eq!(kept, 1, "max_keep prunes older checkpoints");

    let mut resumed = Trainer::with_device(config, &Device::Cpu)?;
    let descriptor = resumed.resume_from_latest()?.expect("checkpoint present");
    assert_eq!(descriptor.manifest.progress.optimizer_step, 4);
    assert_eq!(resumed.progress(), trainer.progress());
    assert!(max_abs_diff(&snapshot(trainer.online_vars()), &snapshot(resumed.online_vars())) == 0.0);
    assert!(max_abs_diff(&snapshot(trainer.target_vars()), &snapshot(resumed.target_vars())) == 0.0);

    // The schedule is exhausted, so a resumed run takes no further steps.
    let mut more = batches(resumed.config(), 6, 3);
    assert_eq!(resumed.run(&mut more)?.steps, 0);
    Ok(())
}

#[test]
fn target_network_trails_the_online_network() -> anyhow::Result<()> {
    let config = tiny_config(None, 10);
    let mut trainer = Trainer::with_device(config.clone(), &Device::Cpu)?;
    let initial_target = snapshot(trainer.target_vars());
    assert_eq!(max_abs_diff(&initial_target, &snapshot(trainer.online_vars())), 0.0);

    let mut source = batches(&config, 9, 1);
    let batch = source.next_batch()?.expect("one batch");
    let outcome = trainer.train_step(&batch)?;
    assert_eq!(outcome.step, 1);
    assert!(outcome.loss.is_finite() && outcome.td_loss.is_finite());
    assert!(outcome.metrics.get("td").is_some());
    assert!(outcome.metrics.get("action_arm").is_some());

    let online = snapshot(trainer.online_vars());
    let target = snapshot(trainer.target_vars());
    let moved = max_abs_diff(&target, &initial_target);
    let gap_before = max_abs_diff(&online, &initial_target);
    assert!(moved > 0.0);
    assert!(moved < gap_before, "target moves only a tau fraction of the way");
    Ok(())
}

#[test]
fn evaluation_leaves_parameters_untouched() -> anyhow::Result<()> {
    let config = tiny_config(None, 10);
    let mut trainer = Trainer::with_device(config.clone(), &Device::Cpu)?;
    let before = snapshot(trainer.online_vars());

    let mut source = batches(&config, 2, 5);
    let summary = trainer.evaluate(&mut source, Some(2))?;
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.samples, 4);
    assert!(summary.average_loss.is_finite());
    assert_eq!(max_abs_diff(&before, &snapshot(trainer.online_vars())), 0.0);
    assert_eq!(trainer.progress().optimizer_step, 0);
    Ok(())
}

#[test]
fn stop_request_ends_the_run_early() -> anyhow::Result<()> {
    let config = tiny_config(None, 10);
    let mut trainer = Trainer::with_device(config.clone(), &Device::Cpu)?;
    let mut source = batches(&config, 4, 10);
    let mut calls = 0;
    let summary = trainer.run_with_shutdown(&mut source, || {
        calls += 1;
        calls > 2
    })?;
    assert_eq!(summary.steps, 2);

    let lr = trainer.learning_rate();
    assert!(lr > 0.0 && lr < config.optimizer.learning_rate);
    Ok(())
}

use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Map, Number, Value};
use training::{CheckpointConfig, SyntheticBatches, Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Robot policy training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON training config; defaults are used when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "N", help = "Total optimizer steps")]
    steps: Option<usize>,

    #[arg(long, value_name = "DIR", help = "Write checkpoints under DIR")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Write TensorBoard event files under DIR")]
    tensorboard_dir: Option<PathBuf>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(steps) = args.steps {
        config.scheduler.total_steps = Some(steps);
    }
    if let Some(directory) = args.checkpoint_dir.clone() {
        let every_n_steps = config
            .runtime
            .checkpoint
            .as_ref()
            .map_or(100, |existing| existing.every_n_steps);
        let max_keep = config.runtime.checkpoint.as_ref().and_then(|c| c.max_keep);
        config.runtime.checkpoint = Some(CheckpointConfig {
            directory,
            every_n_steps,
            max_keep,
        });
    }
    if let Some(directory) = args.tensorboard_dir.clone() {
        config.runtime.logging.tensorboard = Some(directory);
    }

    config.validate()?;

    let mut trainer = Trainer::new(config.clone())?;

    if args.resume {
        if let Some(descriptor) = trainer.resume_from_latest()? {
            println!(
                "resumed from checkpoint {} (step {})",
                descriptor.directory.display(),
                descriptor.manifest.progress.optimizer_step
            );
        }
    }

    let device = trainer.device().clone();
    let seed = config.runtime.seed;
    if config.runtime.evaluation.every_n_steps.is_some() {
        let evaluation = SyntheticBatches::new(
            &config.model,
            &config.data,
            seed.wrapping_add(1),
            &device,
        )?;
        trainer.set_evaluation_source(Box::new(evaluation));
    }
    // Offset by the resumed step so a resumed run does not replay batches.
    let mut batches = SyntheticBatches::new(
        &config.model,
        &config.data,
        seed.wrapping_add(trainer.progress().optimizer_step as u64 * 7919),
        &device,
    )?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary =
        trainer.run_with_shutdown(&mut batches, || shutdown_flag.load(Ordering::Relaxed))?;

    println!(
        "finished {} step(s); total step {}; last loss {}",
        summary.steps,
        trainer.progress().optimizer_step,
        summary
            .last_loss
            .map_or_else(|| "n/a".to_string(), |loss| format!("{loss:.6}"))
    );
    if let Some(path) = summary.last_checkpoint {
        println!("last checkpoint: {}", path.display());
    }

    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Assigns `new_value` at a dot-separated object path, creating missing
/// (or null) intermediate objects.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' has an empty segment"
        )));
    }

    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{}' points into a non-object value",
                segment
            )));
        };
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_reach_nested_sections() {
        let overrides = vec![
            "model.seq_len=4".parse::<OverrideArg>().unwrap(),
            "loss.td_weight=0.5".parse::<OverrideArg>().unwrap(),
            "runtime.logging.enable_stdout=false".parse::<OverrideArg>().unwrap(),
        ];
        let config = apply_overrides(TrainingConfig::default(), &overrides).unwrap();
        assert_eq!(config.model.seq_len, 4);
        assert!((config.loss.td_weight - 0.5).abs() < 1e-6);
        assert!(!config.runtime.logging.enable_stdout);
    }

    #[test]
    fn override_into_scalar_is_rejected() {
        let overrides = vec!["loss.gamma.inner=1".parse::<OverrideArg>().unwrap()];
        assert!(apply_overrides(TrainingConfig::default(), &overrides).is_err());
        assert!("=3".parse::<OverrideArg>().is_err());
    }
}

//! Console lines and TensorBoard event files for training progress.
//!
//! Every optimizer step becomes one `Event` whose `Summary` carries all the
//! scalars of that step, so a TensorBoard reader sees the loss terms, the
//! learning rate and the throughput under one step index.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    TrainingError,
};

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Named scalar values recorded together for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarGroup {
    prefix: &'static str,
    values: Vec<(String, f64)>,
}

impl ScalarGroup {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.values.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    fn tag(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn console_line(&self, step: usize) -> String {
        let fields = self
            .values
            .iter()
            .map(|(name, value)| format!("{name}={}", format_value(*value)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} step={} {}", self.prefix, step, fields)
    }
}

fn format_value(value: f64) -> String {
    if value != 0.0 && (value.abs() < 1e-3 || value.abs() >= 1e5) {
        format!("{value:.3e}")
    } else {
        format!("{value:.4}")
    }
}

/// Scalars reported after an optimizer step.
pub fn training_scalars(lr: f64, snapshot: &StepSnapshot) -> ScalarGroup {
    let mut group = ScalarGroup::new("train");
    group.push("loss", snapshot.step_loss);
    group.push("loss_ema", snapshot.loss);
    for (name, value) in snapshot.terms.terms() {
        group.push(*name, *value as f64);
    }
    group.push("grad_norm", snapshot.raw_grad_norm);
    group.push("samples_per_sec", snapshot.samples_per_sec);
    group.push("learning_rate", lr);
    group
}

pub fn evaluation_scalars(summary: &EvaluationSummary) -> ScalarGroup {
    let mut group = ScalarGroup::new("eval");
    group.push("loss", summary.average_loss);
    group.push("td_loss", summary.average_td_loss);
    group.push("samples", summary.samples as f64);
    group.push("batches", summary.batches as f64);
    group
}

pub struct Logger {
    stdout: bool,
    events: Option<EventFile>,
}

impl Logger {
    pub fn from_config(config: &LoggingConfig) -> Result<Self, TrainingError> {
        let events = config
            .tensorboard
            .as_deref()
            .map(|dir| EventFile::create(dir, config.tensorboard_flush_every_n))
            .transpose()?;
        Ok(Self {
            stdout: config.enable_stdout,
            events,
        })
    }

    /// Path of the event file, when TensorBoard output is enabled.
    pub fn event_file(&self) -> Option<&Path> {
        self.events.as_ref().map(|events| events.path.as_path())
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, snapshot: &StepSnapshot) {
        self.record(step, &training_scalars(lr, snapshot));
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        self.record(step, &evaluation_scalars(summary));
    }

    pub fn record(&mut self, step: usize, group: &ScalarGroup) {
        if self.stdout {
            println!("{}", group.console_line(step));
        }
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.append(step as i64, group) {
                log::warn!("dropping tensorboard output after write failure: {}", err);
                self.events = None;
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.flush() {
                log::warn!("{}", err);
            }
        }
    }
}

/// Append-only TFRecord file of `Event` messages.
struct EventFile {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    unflushed: usize,
}

impl EventFile {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let path = dir.join(format!(
            "events.out.tfevents.{now}.{host}.{}",
            std::process::id()
        ));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        log::info!("writing tensorboard events to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            unflushed: 0,
        })
    }

    fn append(&mut self, step: i64, group: &ScalarGroup) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or(0.0),
            step,
            summary: Some(Summary {
                value: group
                    .values
                    .iter()
                    .map(|(name, value)| SummaryValue {
                        tag: group.tag(name),
                        simple_value: Some(*value as f32),
                    })
                    .collect(),
            }),
        };
        let record = frame_record(&event.encode_to_vec());
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write {}: {err}",
                self.path.display()
            ))
        })?;

        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to flush {}: {err}",
                self.path.display()
            ))
        })?;
        self.unflushed = 0;
        Ok(())
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: little-endian u64 length, masked CRC of the length,
/// payload, masked CRC of the payload.
fn frame_record(payload: &[u8]) -> Bytes {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc(payload));
    record.freeze()
}

fn masked_crc(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize().rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

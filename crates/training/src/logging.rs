//! Summary artifacts in the TensorBoard event-file format.
//!
//! Scalars cover loss, gradient norms and the learning rate; text summaries
//! carry the rendered decoding comparisons produced by evaluation. Events
//! are length-framed protobuf records with masked CRC32 checksums.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    metrics::{EvaluationSummary, StepSnapshot},
    optimizer::GradientReport,
    TrainingError,
};

const DT_STRING: i32 = 7;

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub events_dir: Option<PathBuf>,
    pub flush_every_n: usize,
}

impl LoggingSettings {
    pub fn new(events_dir: Option<PathBuf>, flush_every_n: usize) -> Self {
        Self {
            events_dir,
            flush_every_n: flush_every_n.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self {
            events_dir: None,
            flush_every_n: 1,
        }
    }
}

pub struct Logger {
    writer: Option<SummaryWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let writer = settings
            .events_dir
            .as_ref()
            .map(|dir| SummaryWriter::create(dir, settings.flush_every_n))
            .transpose()?;
        Ok(Self { writer })
    }

    pub fn log_training_step(
        &mut self,
        step: u64,
        learning_rate: f64,
        snapshot: &StepSnapshot,
        gradients: &GradientReport,
    ) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let step = step as i64;
        let _ = writer.write_scalar("train/loss", step, snapshot.step_loss);
        let _ = writer.write_scalar("train/loss_ema", step, snapshot.loss);
        let _ = writer.write_scalar("train/gradient_norm", step, gradients.global_norm);
        let _ = writer.write_scalar("train/learning_rate", step, learning_rate);
        let _ = writer.write_scalar(
            "train/examples_processed",
            step,
            snapshot.total_examples as f64,
        );
        for (name, norm) in &gradients.per_parameter {
            let _ = writer.write_scalar(&format!("gradient_norm/{name}"), step, *norm);
        }
    }

    pub fn log_evaluation(&mut self, step: u64, summary: &EvaluationSummary) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let step = step as i64;
        let _ = writer.write_scalar("token_accuracy", step, summary.token_accuracy);
        let _ = writer.write_scalar("log_perplexity", step, summary.log_perplexity);
    }

    pub fn log_text(&mut self, tag: &str, step: u64, text: &str) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_text(tag, step as i64, text);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct SummaryWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl SummaryWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create events directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create events file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
                tensor: None,
                metadata: None,
            }],
        };
        self.write_event(step, summary)
    }

    fn write_text(&mut self, tag: &str, step: i64, text: &str) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: None,
                tensor: Some(TensorProto {
                    dtype: DT_STRING,
                    string_val: vec![text.as_bytes().to_vec()],
                }),
                metadata: Some(SummaryMetadata {
                    plugin_data: Some(summary_metadata::PluginData {
                        plugin_name: "text".to_string(),
                    }),
                }),
            }],
        };
        self.write_event(step, summary)
    }

    fn write_event(&mut self, step: i64, summary: Summary) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };

        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode summary event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write summary event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush events file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

#[derive(Clone, PartialEq, Message)]
struct TensorProto {
    #[prost(int32, tag = "1")]
    dtype: i32,
    #[prost(bytes = "vec", repeated, tag = "8")]
    string_val: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryMetadata {
    #[prost(message, optional, tag = "1")]
    plugin_data: Option<summary_metadata::PluginData>,
}

mod summary_metadata {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct PluginData {
        #[prost(string, tag = "1")]
        pub plugin_name: String,
    }
}

mod summary {
    use prost::Message;

    use super::{SummaryMetadata, TensorProto};

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
        #[prost(message, optional, tag = "8")]
        pub tensor: Option<TensorProto>,
        #[prost(message, optional, tag = "9")]
        pub metadata: Option<SummaryMetadata>,
    }
}

//! Checkpoint evaluation: aggregate masked metrics, qualitative decoding
//! samples and the cancellable poll for newer checkpoints.

use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use candle_core::{Device, Tensor};
use dataset::{evaluation_batches, JsonlSource, PipelineConfig, RecordFileSource};
use model::SequenceModel;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use vocab::Vocabulary;

use crate::{
    checkpoint::{CheckpointDescriptor, CheckpointManager},
    config::DataFormat,
    decode::{decode_encoded, RandomSamplingStrategy, TopKSamplingStrategy},
    logging::Logger,
    loss::MaskedCrossEntropy,
    masks,
    metrics::EvaluationMetrics,
    trainer::shift_batch,
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct EvaluationOptions {
    pub data: PathBuf,
    pub format: DataFormat,
    pub batch_size: usize,
    /// Evaluate only this many batches, drawn from a shuffled view.
    pub take: Option<u64>,
    pub shuffle_buffer: usize,
    pub seed: u64,
    pub sample_count: usize,
    /// How many leading tokens of each sampled example seed the decoder.
    pub seed_tokens: usize,
    pub top_k: usize,
    pub max_decode_len: usize,
}

impl EvaluationOptions {
    pub fn new(data: impl Into<PathBuf>, format: DataFormat) -> Self {
        Self {
            data: data.into(),
            format,
            batch_size: 1,
            take: None,
            shuffle_buffer: 1000,
            seed: 42,
            sample_count: 5,
            seed_tokens: 4,
            top_k: 5,
            max_decode_len: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodedSample {
    pub ground_truth: String,
    pub random_sampled: String,
    pub top_k: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub global_step: u64,
    pub token_accuracy: f64,
    pub log_perplexity: f64,
    pub tokens: u64,
    pub samples: Vec<DecodedSample>,
}

/// Evaluates an already-restored model against the dataset and emits scalar
/// and text summaries tagged with the checkpoint's step.
pub fn evaluate_checkpoint<M: SequenceModel>(
    model: &M,
    vocab: &Vocabulary,
    descriptor: &CheckpointDescriptor,
    options: &EvaluationOptions,
    device: &Device,
    logger: &mut Logger,
) -> Result<EvaluationReport, TrainingError> {
    let step = descriptor.manifest.counters.global_step;
    let loss_engine = MaskedCrossEntropy::new();
    let mut metrics = EvaluationMetrics::default();

    let stream = batches_for(options, options.batch_size, options.take)?;
    for item in stream {
        let batch = item?;
        if batch.cols() < 2 {
            continue;
        }
        let (inputs, targets, rows, cols) = shift_batch(&batch);
        let input_tensor =
            Tensor::from_slice(&inputs, (rows, cols), device).map_err(to_runtime_error)?;
        let target_tensor =
            Tensor::from_slice(&targets, (rows, cols), device).map_err(to_runtime_error)?;
        let mask =
            masks::combined_mask(&inputs, rows, cols, device).map_err(to_runtime_error)?;

        let output = model
            .forward(&input_tensor, false, &mask)
            .map_err(to_runtime_error)?;
        let loss = loss_engine.compute(&output.logits, &input_tensor, &target_tensor)?;
        metrics.update(
            loss.metrics.average_loss() as f64,
            loss.metrics.total_tokens() as u64,
            loss.metrics.correct_tokens() as u64,
        );
    }

    let summary = metrics
        .finalize()
        .ok_or_else(|| TrainingError::runtime("evaluation produced no tokens"))?;

    let samples = decode_samples(model, vocab, options, device)?;

    logger.log_evaluation(step, &summary);
    for (index, sample) in samples.iter().enumerate() {
        logger.log_text(
            &format!("decoded_example_{}", index + 1),
            step,
            &render_markdown(sample, options.top_k),
        );
    }
    logger.flush();

    Ok(EvaluationReport {
        global_step: step,
        token_accuracy: summary.token_accuracy,
        log_perplexity: summary.log_perplexity,
        tokens: summary.tokens,
        samples,
    })
}

/// Draws a fixed-size sample from a shuffled view of the dataset and decodes
/// two continuations per example, seeded from its first tokens.
fn decode_samples<M: SequenceModel>(
    model: &M,
    vocab: &Vocabulary,
    options: &EvaluationOptions,
    device: &Device,
) -> Result<Vec<DecodedSample>, TrainingError> {
    let top_k_strategy = TopKSamplingStrategy::new(options.top_k)?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut samples = Vec::with_capacity(options.sample_count);

    let stream = batches_for(options, 1, Some(options.sample_count as u64))?;
    for item in stream {
        let batch = item?;
        let row = batch.row(0);
        if row.is_empty() {
            continue;
        }
        let seed = &row[..options.seed_tokens.min(row.len())];

        let ground_truth = vocab.decode(row)?;
        let random_ids = decode_encoded(
            model,
            seed,
            vocab.end_idx(),
            &RandomSamplingStrategy,
            options.max_decode_len,
            device,
            &mut rng,
        )?;
        let top_k_ids = decode_encoded(
            model,
            seed,
            vocab.end_idx(),
            &top_k_strategy,
            options.max_decode_len,
            device,
            &mut rng,
        )?;

        samples.push(DecodedSample {
            ground_truth,
            random_sampled: vocab.decode(&random_ids)?,
            top_k: vocab.decode(&top_k_ids)?,
        });
    }

    Ok(samples)
}

fn render_markdown(sample: &DecodedSample, k: usize) -> String {
    format!(
        "Ground truth: {}\n\nRandom sampled: {}\n\nTop-{}: {}",
        sample.ground_truth, sample.random_sampled, k, sample.top_k
    )
}

fn batches_for(
    options: &EvaluationOptions,
    batch_size: usize,
    take: Option<u64>,
) -> Result<dataset::BatchStream, TrainingError> {
    let config = PipelineConfig {
        batch_size,
        shuffle_buffer: options.shuffle_buffer,
        seed: options.seed,
    };
    let stream = match options.format {
        DataFormat::Jsonl => {
            evaluation_batches(JsonlSource::new(&options.data), config, take)?
        }
        DataFormat::Records => {
            evaluation_batches(RecordFileSource::new(&options.data), config, take)?
        }
    };
    Ok(stream)
}

/// Blocks until a checkpoint newer than `last_step` appears. Cancellation is
/// observed at the top of every iteration and between sleep slices; returns
/// `None` when cancelled.
pub fn wait_for_newer_checkpoint(
    manager: &CheckpointManager,
    last_step: u64,
    poll_interval: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    const SLICE: Duration = Duration::from_millis(250);
    loop {
        if cancelled() {
            return Ok(None);
        }
        if let Some(descriptor) = manager.latest()? {
            if descriptor.manifest.counters.global_step > last_step {
                return Ok(Some(descriptor));
            }
        }
        let deadline = Instant::now() + poll_interval;
        while Instant::now() < deadline {
            if cancelled() {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(SLICE.min(remaining));
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointManifest, FileRecord, TrainingCounters, CHECKPOINT_VERSION};
    use std::fs;

    fn write_manifest(dir: &std::path::Path, step: u64) {
        let record = FileRecord {
            filename: "x".into(),
            sha256: "0".into(),
            bytes: 0,
        };
        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: 0,
            config_sha256: String::new(),
            model: record.clone(),
            optimizer: record,
            counters: TrainingCounters {
                global_step: step,
                examples_processed: 0,
            },
        };
        let step_dir = dir.join(format!("step_{:012}", step));
        fs::create_dir_all(&step_dir).unwrap();
        let file = fs::File::create(step_dir.join("manifest.json")).unwrap();
        serde_json::to_writer(file, &manifest).unwrap();
    }

    #[test]
    fn polling_observes_cancellation_first() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path(), 5);
        let result =
            wait_for_newer_checkpoint(&manager, 0, Duration::from_secs(10), &|| true).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn polling_returns_a_strictly_newer_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path(), 5);
        write_manifest(tmp.path(), 7);

        let descriptor =
            wait_for_newer_checkpoint(&manager, 3, Duration::from_millis(10), &|| false)
                .unwrap()
                .expect("newer checkpoint");
        assert_eq!(descriptor.manifest.counters.global_step, 7);
    }

    #[test]
    fn render_markdown_names_all_three_decodings() {
        let sample = DecodedSample {
            ground_truth: "gt".into(),
            random_sampled: "rand".into(),
            top_k: "top".into(),
        };
        let rendered = render_markdown(&sample, 5);
        assert!(rendered.contains("Ground truth: gt"));
        assert!(rendered.contains("Random sampled: rand"));
        assert!(rendered.contains("Top-5: top"));
    }
}

//! The training loop: shift, mask, forward, masked loss, gradient step,
//! counters, periodic console progress, summaries and checkpoints.

use std::time::Instant;

use candle_core::{Device, Tensor};
use dataset::Batch;
use model::SequenceModel;

use crate::{
    checkpoint::{self, CheckpointDescriptor, CheckpointManager, SaveRequest, TrainingCounters},
    logging::{Logger, LoggingSettings},
    loss::{LossOutput, MaskedCrossEntropy},
    masks,
    metrics::TrainingMetrics,
    optimizer::{Algorithm, TrainerOptimizer},
    schedule::{build_schedule, LearningRateSchedule},
    TrainingConfig, TrainingError,
};

/// Picks the CUDA device when one is usable, otherwise the CPU.
pub fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => {
            if device.is_cuda() {
                println!("device: using CUDA GPU #0");
            } else {
                println!("device: using CPU");
            }
            device
        }
        Err(err) => {
            eprintln!("cuda reported available but initialization failed: {err}");
            Device::Cpu
        }
    }
}

pub struct Trainer<M: SequenceModel> {
    config: TrainingConfig,
    device: Device,
    model: M,
    optimizer: TrainerOptimizer,
    schedule: Box<dyn LearningRateSchedule>,
    loss: MaskedCrossEntropy,
    counters: TrainingCounters,
    checkpoints: CheckpointManager,
    metrics: TrainingMetrics,
    logger: Logger,
    parameter_count: usize,
}

impl<M: SequenceModel> Trainer<M> {
    /// Builds a trainer around an already-constructed model. Pass the
    /// vocabulary's start index as `prefix_start_idx` to exclude noun-chunk
    /// conditioning prefixes from the loss.
    pub fn new(
        config: TrainingConfig,
        model: M,
        device: Device,
        prefix_start_idx: Option<i64>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let named_parameters = model.parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let optimizer =
            TrainerOptimizer::new(named_parameters, Algorithm::from(&config.optimizer))?;
        let parameter_count = optimizer.parameter_count();

        let schedule = build_schedule(
            &config.schedule,
            config.optimizer.learning_rate,
            config.model.hidden_size,
        )?;

        let loss = MaskedCrossEntropy::new().with_prefix_exclusion(prefix_start_idx);

        let checkpoints = CheckpointManager::new(
            config.runtime.checkpoint.directory.clone(),
            config.runtime.checkpoint.max_keep,
        );

        let events_dir = config
            .runtime
            .events_dir
            .clone()
            .unwrap_or_else(|| config.runtime.checkpoint.directory.join("events"));
        let logger = Logger::new(LoggingSettings::new(Some(events_dir), 1))?;

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            schedule,
            loss,
            counters: TrainingCounters::default(),
            checkpoints,
            metrics: TrainingMetrics::new(),
            logger,
            parameter_count,
        })
    }

    pub fn counters(&self) -> TrainingCounters {
        self.counters
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Restores model weights, optimizer state and counters from the most
    /// recent checkpoint. A missing checkpoint is not an error: training
    /// simply starts from scratch.
    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(descriptor) = self.checkpoints.latest()? else {
            return Ok(None);
        };
        let outcome = self.checkpoints.load(&descriptor.directory)?;
        checkpoint::apply_model_weights(&self.model, &outcome.model_weights_path)?;
        self.optimizer.load_state(outcome.optimizer_state)?;
        self.counters = outcome.manifest.counters;
        println!(
            "restored checkpoint from '{}' (step {})",
            descriptor.directory.display(),
            self.counters.global_step
        );
        Ok(Some(descriptor))
    }

    pub fn train<I>(&mut self, batches: I) -> Result<(), TrainingError>
    where
        I: IntoIterator<Item = dataset::Result<Batch>>,
    {
        self.train_with_shutdown(batches, || false)
    }

    /// Runs the loop until the batch stream ends, `should_stop` observes a
    /// cancellation, or a single-shot checkpoint completes. Cancellation is
    /// only observed between steps, so every step's effects are either
    /// fully applied or not applied at all.
    pub fn train_with_shutdown<I, F>(
        &mut self,
        batches: I,
        mut should_stop: F,
    ) -> Result<(), TrainingError>
    where
        I: IntoIterator<Item = dataset::Result<Batch>>,
        F: FnMut() -> bool,
    {
        println!(
            "starting training on {:?} at step {}",
            self.device, self.counters.global_step
        );
        let mut report_timer = Instant::now();

        for item in batches {
            if should_stop() {
                break;
            }
            let batch = item?;
            if batch.cols() < 2 {
                // A single-column batch has nothing to predict.
                continue;
            }

            let (inputs, targets, rows, cols) = shift_batch(&batch);
            let input_tensor = Tensor::from_slice(&inputs, (rows, cols), &self.device)
                .map_err(to_runtime_error)?;
            let target_tensor = Tensor::from_slice(&targets, (rows, cols), &self.device)
                .map_err(to_runtime_error)?;
            let mask = masks::combined_mask(&inputs, rows, cols, &self.device)
                .map_err(to_runtime_error)?;

            let output = self
                .model
                .forward(&input_tensor, true, &mask)
                .map_err(to_runtime_error)?;
            let LossOutput { loss, metrics } =
                self.loss
                    .compute(&output.logits, &input_tensor, &target_tensor)?;

            let mut grads = loss.backward().map_err(to_runtime_error)?;
            let step = self.counters.global_step + 1;
            let learning_rate = self.schedule.learning_rate(step);
            let report = self.optimizer.step(learning_rate, &mut grads)?;

            self.counters.global_step = step;
            self.counters.examples_processed += rows as u64;

            let snapshot = self.metrics.record_step(
                rows as u64,
                metrics.average_loss() as f64,
                report.global_norm,
            );

            if step == 1 {
                println!("number of trainable parameters: {}", self.parameter_count);
            }

            if step % self.config.runtime.log_every_n_steps == 0 {
                println!(
                    "step {:>8}\tloss {:>8.4}\texamples {:>10}\ttime {:.3}s",
                    step,
                    snapshot.step_loss,
                    self.counters.examples_processed,
                    report_timer.elapsed().as_secs_f64()
                );
                report_timer = Instant::now();
            }

            if step % self.config.runtime.summarize_every_n_steps == 0 {
                self.logger
                    .log_training_step(step, learning_rate, &snapshot, &report);
            }

            if step % self.config.runtime.checkpoint.every_n_steps == 0 {
                let descriptor = self.checkpoints.save(SaveRequest {
                    config: &self.config,
                    model: &self.model,
                    optimizer: &self.optimizer,
                    counters: self.counters,
                })?;
                println!(
                    "saving checkpoint at '{}'",
                    descriptor.directory.display()
                );
                if !self.config.runtime.checkpoint.continuous {
                    break;
                }
            }
        }

        self.logger.flush();
        Ok(())
    }
}

/// Teacher-forcing shift: inputs drop the last column, targets drop the
/// first.
pub(crate) fn shift_batch(batch: &Batch) -> (Vec<i64>, Vec<i64>, usize, usize) {
    let rows = batch.rows();
    let cols = batch.cols() - 1;
    let mut inputs = Vec::with_capacity(rows * cols);
    let mut targets = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let row = batch.row(r);
        inputs.extend_from_slice(&row[..cols]);
        targets.extend_from_slice(&row[1..]);
    }
    (inputs, targets, rows, cols)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_offsets_by_one_position() {
        let batch = Batch::from_sequences(&[vec![1, 2, 3, 0], vec![1, 2, 0, 0]]).unwrap();
        let (inputs, targets, rows, cols) = shift_batch(&batch);
        assert_eq!((rows, cols), (2, 3));
        assert_eq!(inputs, vec![1, 2, 3, 1, 2, 0]);
        assert_eq!(targets, vec![2, 3, 0, 2, 0, 0]);
    }
}

use std::f64::consts::LN_2;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Rolling training telemetry; one snapshot per optimizer step.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    examples_processed: u64,
    loss_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            examples_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, examples: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;
        self.examples_processed = self.examples_processed.saturating_add(examples);
        let loss_avg = self.loss_ema.update(loss);

        StepSnapshot {
            step_loss: loss,
            loss: loss_avg,
            grad_norm,
            examples,
            total_examples: self.examples_processed,
            step_duration,
            wall_time: now.duration_since(self.start_time),
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub step_loss: f64,
    pub loss: f64,
    pub grad_norm: f64,
    pub examples: u64,
    pub total_examples: u64,
    pub step_duration: Duration,
    pub wall_time: Duration,
}

/// Running masked accuracy and log-perplexity over an evaluation pass.
///
/// `update` takes the per-batch mean loss in nats together with the number
/// of unmasked positions, so the aggregate is weighted exactly like the
/// per-position padding mask.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    token_count: u64,
    correct_tokens: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, mean_loss: f64, tokens: u64, correct: u64) {
        self.loss_sum += mean_loss * tokens as f64;
        self.token_count += tokens;
        self.correct_tokens += correct;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.token_count == 0 {
            return None;
        }
        let mean_nats = self.loss_sum / self.token_count as f64;
        Some(EvaluationSummary {
            token_accuracy: self.correct_tokens as f64 / self.token_count as f64,
            log_perplexity: mean_nats / LN_2,
            tokens: self.token_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub token_accuracy: f64,
    /// Bits per token: mean cross entropy in nats divided by ln 2.
    pub log_perplexity: f64,
    pub tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_metrics_weight_by_token_count() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(1.0, 3, 2);
        metrics.update(2.0, 1, 1);
        let summary = metrics.finalize().unwrap();
        assert_eq!(summary.tokens, 4);
        assert!((summary.token_accuracy - 0.75).abs() < 1e-12);
        // Weighted mean is 1.25 nats.
        assert!((summary.log_perplexity - 1.25 / LN_2).abs() < 1e-12);
    }

    #[test]
    fn empty_evaluation_has_no_summary() {
        assert!(EvaluationMetrics::default().finalize().is_none());
    }

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
        assert_eq!(ema.value(), Some(3.0));
    }
}

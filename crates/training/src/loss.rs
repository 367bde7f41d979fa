use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use vocab::PAD_ID;

use crate::TrainingError;

/// Masked cross entropy over a teacher-forcing shifted batch.
///
/// A target position participates in the reduction only when the input
/// token feeding it is not padding. With prefix exclusion enabled, every
/// position up to and including the first start token in the target row is
/// additionally excluded, so the model is not penalized for reproducing its
/// own conditioning prefix.
#[derive(Debug, Clone, Default)]
pub struct MaskedCrossEntropy {
    prefix_start_idx: Option<i64>,
}

impl MaskedCrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix_exclusion(mut self, start_idx: Option<i64>) -> Self {
        self.prefix_start_idx = start_idx;
        self
    }

    pub fn compute(
        &self,
        logits: &Tensor,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() != 3 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits shaped [batch, seq, vocab]",
            ));
        }
        let vocab_size = dims[2];
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }
        let token_dims = &dims[..2];
        if targets.dims() != token_dims || inputs.dims() != token_dims {
            return Err(TrainingError::runtime(
                "input and target tensors must match logits batch/seq dimensions",
            ));
        }
        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .reshape((token_count, vocab_size))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .reshape((token_count,))
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?;

        let mut valid_mask = inputs
            .reshape((token_count,))
            .map_err(to_runtime_error)?
            .ne(PAD_ID)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        if let Some(start_idx) = self.prefix_start_idx {
            let prefix = prefix_exclusion_mask(targets, start_idx)?;
            let prefix = Tensor::from_vec(prefix, (token_count,), device)
                .map_err(to_runtime_error)?;
            valid_mask = (&valid_mask * &prefix).map_err(to_runtime_error)?;
        }

        let total_tokens = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "batch contains no unmasked target positions",
            ));
        }

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let weighted = (&nll * &valid_mask).map_err(to_runtime_error)?;
        let loss = weighted
            .sum_all()
            .map_err(to_runtime_error)?
            .affine(1.0 / total_tokens as f64, 0.0)
            .map_err(to_runtime_error)?;
        let average_loss = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        let predictions = logits_flat.argmax(D::Minus1).map_err(to_runtime_error)?;
        let correct = predictions
            .eq(&targets_flat)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let correct_tokens = (&correct * &valid_mask)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens,
                correct_tokens,
            },
        })
    }
}

/// 0.0 for every position up to and including the first start token of each
/// target row (plus nothing when the row holds no start token).
fn prefix_exclusion_mask(targets: &Tensor, start_idx: i64) -> Result<Vec<f32>, TrainingError> {
    let rows = targets.to_vec2::<i64>().map_err(to_runtime_error)?;
    let mut mask = Vec::with_capacity(rows.iter().map(Vec::len).sum());
    for row in &rows {
        let prefix_len = row
            .iter()
            .position(|&token| token == start_idx)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        for position in 0..row.len() {
            mask.push(if position < prefix_len { 0.0 } else { 1.0 });
        }
    }
    Ok(mask)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    /// Mean negative log likelihood in nats over unmasked positions.
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const VOCAB: usize = 8;

    fn shift(rows: &[Vec<i64>]) -> (Tensor, Tensor, usize, usize) {
        let device = Device::Cpu;
        let batch = rows.len();
        let seq = rows[0].len() - 1;
        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        for row in rows {
            inputs.extend_from_slice(&row[..row.len() - 1]);
            targets.extend_from_slice(&row[1..]);
        }
        (
            Tensor::from_vec(inputs, (batch, seq), &device).unwrap(),
            Tensor::from_vec(targets, (batch, seq), &device).unwrap(),
            batch,
            seq,
        )
    }

    fn patterned_logits(batch: usize, seq: usize) -> Tensor {
        let mut data = Vec::with_capacity(batch * seq * VOCAB);
        for b in 0..batch {
            for s in 0..seq {
                for v in 0..VOCAB {
                    data.push(((b + 1) * (s + 1)) as f32 * 0.1 + v as f32 * 0.03);
                }
            }
        }
        Tensor::from_vec(data, (batch, seq, VOCAB), &Device::Cpu).unwrap()
    }

    #[test]
    fn sample_weights_follow_the_shifted_padding_mask() {
        // Rows [1,2,3,0] and [1,2,0,0] leave 3 + 2 valid positions.
        let (inputs, targets, batch, seq) =
            shift(&[vec![1, 2, 3, 0], vec![1, 2, 0, 0]]);
        let logits = Tensor::zeros((batch, seq, VOCAB), candle_core::DType::F32, &Device::Cpu)
            .unwrap();
        let output = MaskedCrossEntropy::new()
            .compute(&logits, &inputs, &targets)
            .unwrap();
        assert_eq!(output.metrics.total_tokens(), 5);
        // Uniform logits: every valid position contributes ln(VOCAB).
        let expected = (VOCAB as f32).ln();
        assert!((output.metrics.average_loss() - expected).abs() < 1e-5);
    }

    #[test]
    fn masked_positions_cannot_move_the_loss() {
        let (inputs, targets, batch, seq) =
            shift(&[vec![1, 2, 3, 0], vec![1, 2, 0, 0]]);
        let uniform =
            Tensor::zeros((batch, seq, VOCAB), candle_core::DType::F32, &Device::Cpu).unwrap();
        let baseline = MaskedCrossEntropy::new()
            .compute(&uniform, &inputs, &targets)
            .unwrap();

        // Poison only a masked position: row 1 position 2 is fed by padding.
        let mut data = vec![0f32; batch * seq * VOCAB];
        for v in 0..VOCAB {
            data[(seq + 2) * VOCAB + v] = -50.0 + v as f32 * 17.0;
        }
        let poisoned = Tensor::from_vec(data, (batch, seq, VOCAB), &Device::Cpu).unwrap();
        let output = MaskedCrossEntropy::new()
            .compute(&poisoned, &inputs, &targets)
            .unwrap();
        assert!(
            (output.metrics.average_loss() - baseline.metrics.average_loss()).abs() < 1e-5
        );
    }

    #[test]
    fn loss_is_invariant_to_extra_trailing_padding() {
        let (inputs_a, targets_a, batch, seq_a) = shift(&[vec![1, 2, 3, 0]]);
        let (inputs_b, targets_b, _, seq_b) = shift(&[vec![1, 2, 3, 0, 0]]);

        // Shared positions carry identical logits; the extra padded column
        // gets an arbitrary pattern.
        let logits_a = patterned_logits(batch, seq_a);
        let logits_b = patterned_logits(batch, seq_b);

        let loss_a = MaskedCrossEntropy::new()
            .compute(&logits_a, &inputs_a, &targets_a)
            .unwrap();
        let loss_b = MaskedCrossEntropy::new()
            .compute(&logits_b, &inputs_b, &targets_b)
            .unwrap();
        assert_eq!(loss_a.metrics.total_tokens(), loss_b.metrics.total_tokens());
        assert!(
            (loss_a.metrics.average_loss() - loss_b.metrics.average_loss()).abs() < 1e-5
        );
    }

    #[test]
    fn prefix_exclusion_skips_the_conditioning_span() {
        let device = Device::Cpu;
        let start_idx = 4i64;
        // Targets hold the start token at position 1, so positions 0 and 1
        // are excluded and two valid positions remain.
        let inputs = Tensor::from_vec(vec![6i64, 7, 4, 2], (1, 4), &device).unwrap();
        let targets = Tensor::from_vec(vec![7i64, 4, 2, 3], (1, 4), &device).unwrap();
        let logits =
            Tensor::zeros((1, 4, VOCAB), candle_core::DType::F32, &device).unwrap();

        let output = MaskedCrossEntropy::new()
            .with_prefix_exclusion(Some(start_idx))
            .compute(&logits, &inputs, &targets)
            .unwrap();
        assert_eq!(output.metrics.total_tokens(), 2);

        // Without a start token nothing is excluded.
        let no_start = Tensor::from_vec(vec![7i64, 5, 2, 3], (1, 4), &device).unwrap();
        let output = MaskedCrossEntropy::new()
            .with_prefix_exclusion(Some(start_idx))
            .compute(&logits, &inputs, &no_start)
            .unwrap();
        assert_eq!(output.metrics.total_tokens(), 4);
    }

    #[test]
    fn fully_masked_batch_is_a_fatal_error() {
        let device = Device::Cpu;
        let inputs = Tensor::from_vec(vec![0i64, 0], (1, 2), &device).unwrap();
        let targets = Tensor::from_vec(vec![0i64, 0], (1, 2), &device).unwrap();
        let logits =
            Tensor::zeros((1, 2, VOCAB), candle_core::DType::F32, &device).unwrap();
        let result = MaskedCrossEntropy::new().compute(&logits, &inputs, &targets);
        assert!(result.is_err());
    }
}

//! Decoding strategies for qualitative evaluation samples.

use std::cmp::Ordering;

use candle_core::{Device, IndexOp, Tensor};
use model::SequenceModel;
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

use crate::{masks, TrainingError};

/// Picks the next token id from a row of logits.
pub trait SamplingStrategy {
    fn select(&self, logits: &[f32], rng: &mut StdRng) -> Result<usize, TrainingError>;
}

pub struct GreedyStrategy;

impl SamplingStrategy for GreedyStrategy {
    fn select(&self, logits: &[f32], _rng: &mut StdRng) -> Result<usize, TrainingError> {
        logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx)
            .ok_or_else(|| TrainingError::runtime("cannot sample from empty logits"))
    }
}

/// Unconstrained sampling from the full softmax distribution.
pub struct RandomSamplingStrategy;

impl SamplingStrategy for RandomSamplingStrategy {
    fn select(&self, logits: &[f32], rng: &mut StdRng) -> Result<usize, TrainingError> {
        let probs = softmax(logits);
        let dist = WeightedIndex::new(&probs)
            .map_err(|err| TrainingError::runtime(format!("degenerate distribution: {err}")))?;
        Ok(dist.sample(rng))
    }
}

/// Sampling restricted to the `k` highest-probability candidates.
pub struct TopKSamplingStrategy {
    k: usize,
}

impl TopKSamplingStrategy {
    pub fn new(k: usize) -> Result<Self, TrainingError> {
        if k == 0 {
            return Err(TrainingError::initialization("top-k requires k > 0"));
        }
        Ok(Self { k })
    }
}

impl SamplingStrategy for TopKSamplingStrategy {
    fn select(&self, logits: &[f32], rng: &mut StdRng) -> Result<usize, TrainingError> {
        if logits.is_empty() {
            return Err(TrainingError::runtime("cannot sample from empty logits"));
        }
        let mut indices: Vec<usize> = (0..logits.len()).collect();
        indices.sort_unstable_by(|&a, &b| {
            logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal)
        });
        indices.truncate(self.k);

        let top_logits: Vec<f32> = indices.iter().map(|&idx| logits[idx]).collect();
        let probs = softmax(&top_logits);
        let dist = WeightedIndex::new(&probs)
            .map_err(|err| TrainingError::runtime(format!("degenerate distribution: {err}")))?;
        Ok(indices[dist.sample(rng)])
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|logit| (logit - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|e| e / sum).collect()
    } else {
        exps
    }
}

/// Autoregressively extends `seed` until the end token or `max_len` tokens.
/// Returns the full sequence including the seed.
pub fn decode_encoded<M: SequenceModel + ?Sized>(
    model: &M,
    seed: &[i64],
    end_idx: i64,
    strategy: &dyn SamplingStrategy,
    max_len: usize,
    device: &Device,
    rng: &mut StdRng,
) -> Result<Vec<i64>, TrainingError> {
    if seed.is_empty() {
        return Err(TrainingError::runtime(
            "decoding requires at least one seed token",
        ));
    }
    let mut context = seed.to_vec();
    while context.len() < max_len {
        let len = context.len();
        let input =
            Tensor::from_slice(&context, (1, len), device).map_err(to_runtime_error)?;
        let mask = masks::combined_mask(&context, 1, len, device).map_err(to_runtime_error)?;
        let output = model
            .forward(&input, false, &mask)
            .map_err(to_runtime_error)?;
        let logits = output
            .logits
            .i((0, len - 1))
            .map_err(to_runtime_error)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;

        let next = strategy.select(&logits, rng)? as i64;
        context.push(next);
        if next == end_idx {
            break;
        }
    }
    Ok(context)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Result as CandleResult;
    use model::ModelOutput;
    use rand::SeedableRng;

    struct FixedNextToken {
        vocab: usize,
        favored: usize,
    }

    impl SequenceModel for FixedNextToken {
        fn forward(
            &self,
            input_ids: &Tensor,
            _training: bool,
            _mask: &Tensor,
        ) -> CandleResult<ModelOutput> {
            let (batch, seq) = input_ids.dims2()?;
            let mut data = vec![-200f32; batch * seq * self.vocab];
            for b in 0..batch {
                for s in 0..seq {
                    data[(b * seq + s) * self.vocab + self.favored] = 200.0;
                }
            }
            let logits =
                Tensor::from_vec(data, (batch, seq, self.vocab), input_ids.device())?;
            Ok(ModelOutput {
                logits,
                attentions: Vec::new(),
            })
        }

        fn parameters(&self) -> Vec<(String, candle_core::Var)> {
            Vec::new()
        }
    }

    #[test]
    fn greedy_picks_the_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        let choice = GreedyStrategy.select(&[0.0, 5.0, 1.0], &mut rng).unwrap();
        assert_eq!(choice, 1);
    }

    #[test]
    fn top_k_stays_within_the_k_best() {
        let mut rng = StdRng::seed_from_u64(0);
        let strategy = TopKSamplingStrategy::new(2).unwrap();
        for _ in 0..20 {
            let choice = strategy.select(&[0.0, 5.0, 4.0, -3.0], &mut rng).unwrap();
            assert!(choice == 1 || choice == 2);
        }
    }

    #[test]
    fn random_sampling_follows_overwhelming_mass() {
        let mut rng = StdRng::seed_from_u64(0);
        let choice = RandomSamplingStrategy
            .select(&[200.0, -200.0, -200.0], &mut rng)
            .unwrap();
        assert_eq!(choice, 0);
    }

    #[test]
    fn decoding_stops_at_the_end_token() {
        let model = FixedNextToken {
            vocab: 8,
            favored: 3,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let decoded = decode_encoded(
            &model,
            &[1, 2],
            3,
            &GreedyStrategy,
            32,
            &Device::Cpu,
            &mut rng,
        )
        .unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn decoding_respects_the_length_cap() {
        let model = FixedNextToken {
            vocab: 8,
            favored: 3,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let decoded = decode_encoded(
            &model,
            &[1, 2],
            // An end token the model never emits.
            7,
            &GreedyStrategy,
            6,
            &Device::Cpu,
            &mut rng,
        )
        .unwrap();
        assert_eq!(decoded.len(), 6);
    }
}

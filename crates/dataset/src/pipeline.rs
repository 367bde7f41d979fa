//! Lazy batch streams over a sequence source.
//!
//! Training streams repeat the source forever with a seeded buffered shuffle
//! and support skipping already-consumed batches after a restart. Evaluation
//! streams make a single bounded pass. Both run on a worker thread behind a
//! rendezvous channel, so at most one prepared batch exists beyond the one
//! the consumer is using.

use std::sync::mpsc;
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::batching::{Batch, BucketSchedule, BucketedBatcher};
use crate::errors::{DatasetError, Result};

/// A source of token sequences that can be streamed repeatedly.
pub trait SequenceSource {
    type Stream: Iterator<Item = Result<Vec<i64>>>;

    fn stream(&self) -> Result<Self::Stream>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub shuffle_buffer: usize,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle_buffer: 100,
            seed: 42,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DatasetError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Unbounded training stream: shuffle, repeat, batch to a fixed size and
/// skip the first `skip_batches` batches.
pub fn training_batches<S>(
    source: S,
    config: PipelineConfig,
    skip_batches: u64,
) -> Result<BatchStream>
where
    S: SequenceSource + Send + 'static,
{
    config.validate()?;
    let batcher = Batcher::fixed(config.batch_size);
    Ok(BatchStream::spawn(move |emit| {
        run_training(source, config, batcher, skip_batches, emit)
    }))
}

/// Unbounded training stream with sequence-length bucketing instead of a
/// fixed batch size.
pub fn bucketed_training_batches<S>(
    source: S,
    schedule: BucketSchedule,
    config: PipelineConfig,
    skip_batches: u64,
) -> Result<BatchStream>
where
    S: SequenceSource + Send + 'static,
{
    let batcher = Batcher::Bucketed(BucketedBatcher::new(schedule));
    Ok(BatchStream::spawn(move |emit| {
        run_training(source, config, batcher, skip_batches, emit)
    }))
}

/// Bounded evaluation stream: a single pass, optionally shuffled and
/// truncated to `take` batches, with a final partial batch.
pub fn evaluation_batches<S>(
    source: S,
    config: PipelineConfig,
    take: Option<u64>,
) -> Result<BatchStream>
where
    S: SequenceSource + Send + 'static,
{
    config.validate()?;
    Ok(BatchStream::spawn(move |emit| {
        run_evaluation(source, config, take, emit)
    }))
}

/// Accumulates routed sequences until a batch is ready.
enum Batcher {
    Fixed {
        batch_size: usize,
        pending: Vec<Vec<i64>>,
    },
    Bucketed(BucketedBatcher),
}

impl Batcher {
    fn fixed(batch_size: usize) -> Self {
        Self::Fixed {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    fn push(&mut self, sequence: Vec<i64>) -> Result<Option<Batch>> {
        match self {
            Batcher::Fixed {
                batch_size,
                pending,
            } => {
                pending.push(sequence);
                if pending.len() < *batch_size {
                    return Ok(None);
                }
                let sequences = std::mem::take(pending);
                Batch::from_sequences(&sequences).map(Some)
            }
            Batcher::Bucketed(batcher) => batcher.push(sequence),
        }
    }

    fn flush(&mut self) -> Result<Vec<Batch>> {
        match self {
            Batcher::Fixed { pending, .. } => {
                if pending.is_empty() {
                    Ok(Vec::new())
                } else {
                    let sequences = std::mem::take(pending);
                    Ok(vec![Batch::from_sequences(&sequences)?])
                }
            }
            Batcher::Bucketed(batcher) => batcher.flush(),
        }
    }
}

type Emit<'a> = &'a mut dyn FnMut(Result<Batch>) -> bool;

fn run_training<S: SequenceSource>(
    source: S,
    config: PipelineConfig,
    mut batcher: Batcher,
    mut to_skip: u64,
    emit: Emit<'_>,
) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let capacity = config.shuffle_buffer.max(1);

    loop {
        let stream = match source.stream() {
            Ok(stream) => stream,
            Err(err) => {
                emit(Err(err));
                return;
            }
        };

        let mut buffer: Vec<Vec<i64>> = Vec::with_capacity(capacity);
        let mut saw_any = false;

        for item in stream {
            let sequence = match item {
                Ok(sequence) => sequence,
                Err(err) => {
                    emit(Err(err));
                    return;
                }
            };
            if sequence.is_empty() {
                continue;
            }
            saw_any = true;
            buffer.push(sequence);
            if buffer.len() >= capacity
                && !drain_buffer(&mut buffer, &mut rng, &mut batcher, &mut to_skip, emit)
            {
                return;
            }
        }

        if !buffer.is_empty()
            && !drain_buffer(&mut buffer, &mut rng, &mut batcher, &mut to_skip, emit)
        {
            return;
        }

        if !saw_any {
            emit(Err(DatasetError::InvalidConfig(
                "corpus yielded no sequences; refusing to repeat an empty source".into(),
            )));
            return;
        }
    }
}

/// Shuffles and feeds one buffer into the batcher. Returns false once the
/// run should stop.
fn drain_buffer(
    buffer: &mut Vec<Vec<i64>>,
    rng: &mut StdRng,
    batcher: &mut Batcher,
    to_skip: &mut u64,
    emit: Emit<'_>,
) -> bool {
    buffer.shuffle(rng);
    for sequence in buffer.drain(..) {
        match batcher.push(sequence) {
            Ok(Some(batch)) => {
                if *to_skip > 0 {
                    *to_skip -= 1;
                    continue;
                }
                if !emit(Ok(batch)) {
                    return false;
                }
            }
            Ok(None) => {}
            Err(err) => {
                emit(Err(err));
                return false;
            }
        }
    }
    true
}

fn run_evaluation<S: SequenceSource>(
    source: S,
    config: PipelineConfig,
    take: Option<u64>,
    emit: Emit<'_>,
) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    // Shuffling only applies to truncated runs; a full pass keeps source
    // order so metrics cover every record exactly once.
    let capacity = if take.is_some() {
        config.shuffle_buffer.max(1)
    } else {
        1
    };

    let stream = match source.stream() {
        Ok(stream) => stream,
        Err(err) => {
            emit(Err(err));
            return;
        }
    };

    let mut batcher = Batcher::fixed(config.batch_size);
    let mut buffer: Vec<Vec<i64>> = Vec::with_capacity(capacity);
    let mut emitted = 0u64;

    for item in stream {
        let sequence = match item {
            Ok(sequence) => sequence,
            Err(err) => {
                emit(Err(err));
                return;
            }
        };
        if sequence.is_empty() {
            continue;
        }
        buffer.push(sequence);
        if buffer.len() >= capacity {
            match drain_bounded(&mut buffer, &mut rng, &mut batcher, take, &mut emitted, emit) {
                DrainOutcome::Continue => {}
                DrainOutcome::Stop => return,
            }
        }
    }

    if !buffer.is_empty() {
        match drain_bounded(&mut buffer, &mut rng, &mut batcher, take, &mut emitted, emit) {
            DrainOutcome::Continue => {}
            DrainOutcome::Stop => return,
        }
    }

    // Final partial batch of the bounded pass.
    match batcher.flush() {
        Ok(batches) => {
            for batch in batches {
                if take.map_or(false, |limit| emitted >= limit) {
                    return;
                }
                if !emit(Ok(batch)) {
                    return;
                }
                emitted += 1;
            }
        }
        Err(err) => {
            emit(Err(err));
        }
    }
}

enum DrainOutcome {
    Continue,
    Stop,
}

fn drain_bounded(
    buffer: &mut Vec<Vec<i64>>,
    rng: &mut StdRng,
    batcher: &mut Batcher,
    take: Option<u64>,
    emitted: &mut u64,
    emit: Emit<'_>,
) -> DrainOutcome {
    buffer.shuffle(rng);
    for sequence in buffer.drain(..) {
        match batcher.push(sequence) {
            Ok(Some(batch)) => {
                if !emit(Ok(batch)) {
                    return DrainOutcome::Stop;
                }
                *emitted += 1;
                if take.map_or(false, |limit| *emitted >= limit) {
                    return DrainOutcome::Stop;
                }
            }
            Ok(None) => {}
            Err(err) => {
                emit(Err(err));
                return DrainOutcome::Stop;
            }
        }
    }
    DrainOutcome::Continue
}

/// Iterator over batches produced on a worker thread.
pub struct BatchStream {
    receiver: Option<mpsc::Receiver<Result<Batch>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BatchStream {
    fn spawn<F>(body: F) -> Self
    where
        F: FnOnce(Emit<'_>) + Send + 'static,
    {
        // Rendezvous channel: the worker prepares at most one batch beyond
        // the one the consumer currently holds.
        let (sender, receiver) = mpsc::sync_channel(0);
        let worker = thread::spawn(move || {
            let mut emit = |batch: Result<Batch>| sender.send(batch).is_ok();
            body(&mut emit);
        });
        Self {
            receiver: Some(receiver),
            worker: Some(worker),
        }
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Dropping the receiver unblocks the worker's pending send.
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct VecSource(Vec<Vec<i64>>);

    impl SequenceSource for VecSource {
        type Stream = std::vec::IntoIter<Result<Vec<i64>>>;

        fn stream(&self) -> Result<Self::Stream> {
            Ok(self
                .0
                .iter()
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>()
                .into_iter())
        }
    }

    fn source() -> VecSource {
        VecSource((1..=6).map(|i| vec![i, i + 10]).collect())
    }

    #[test]
    fn training_stream_repeats_forever() {
        let config = PipelineConfig {
            batch_size: 2,
            shuffle_buffer: 4,
            seed: 42,
        };
        let stream = training_batches(source(), config, 0).unwrap();
        let batches: Vec<Batch> = stream.take(10).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 10);
        for batch in &batches {
            assert_eq!(batch.rows(), 2);
        }
    }

    #[test]
    fn fixed_seed_is_deterministic_and_skip_resumes() {
        let config = PipelineConfig {
            batch_size: 2,
            shuffle_buffer: 4,
            seed: 7,
        };
        let full: Vec<Batch> = training_batches(source(), config.clone(), 0)
            .unwrap()
            .take(6)
            .collect::<Result<_>>()
            .unwrap();
        let resumed: Vec<Batch> = training_batches(source(), config, 2)
            .unwrap()
            .take(4)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(&full[2..], &resumed[..]);
    }

    #[test]
    fn evaluation_stream_is_bounded_with_partial_tail() {
        let config = PipelineConfig {
            batch_size: 4,
            shuffle_buffer: 100,
            seed: 42,
        };
        let batches: Vec<Batch> = evaluation_batches(source(), config, None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].rows(), 4);
        assert_eq!(batches[1].rows(), 2);
        // Without `take` the pass preserves source order.
        assert_eq!(batches[0].row(0), &[1, 11]);
    }

    #[test]
    fn evaluation_take_truncates() {
        let config = PipelineConfig {
            batch_size: 2,
            shuffle_buffer: 6,
            seed: 42,
        };
        let batches: Vec<Batch> = evaluation_batches(source(), config, Some(1))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn empty_source_is_an_error() {
        let config = PipelineConfig::default();
        let mut stream = training_batches(VecSource(Vec::new()), config, 0).unwrap();
        assert!(stream.next().unwrap().is_err());
    }

    #[test]
    fn bucketed_stream_respects_token_budget() {
        let schedule = BucketSchedule::new(4, 8).unwrap();
        let config = PipelineConfig {
            batch_size: 1,
            shuffle_buffer: 1,
            seed: 42,
        };
        let stream = bucketed_training_batches(source(), schedule, config, 0).unwrap();
        let batches: Vec<Batch> = stream.take(6).collect::<Result<_>>().unwrap();
        for batch in batches {
            // Sequences of length 2 land in the boundary-2 bucket (size 2).
            assert_eq!(batch.rows(), 2);
            assert_eq!(batch.cols(), 2);
        }
    }
}

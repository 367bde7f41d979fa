//! Batch assembly: dynamic padding and sequence-length bucketing.

use vocab::PAD_ID;

use crate::errors::{DatasetError, Result};

/// A rectangular batch of token ids, right-padded with [`PAD_ID`].
///
/// Stored row-major so the training crate can materialize it as a
/// `[rows, cols]` tensor without copying per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    rows: usize,
    cols: usize,
    tokens: Vec<i64>,
}

impl Batch {
    /// Pads `sequences` to the longest one and assembles a batch.
    pub fn from_sequences(sequences: &[Vec<i64>]) -> Result<Self> {
        if sequences.is_empty() {
            return Err(DatasetError::InvalidConfig(
                "cannot build a batch from zero sequences".into(),
            ));
        }
        let cols = sequences
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(1);
        let rows = sequences.len();
        let mut tokens = Vec::with_capacity(rows * cols);
        for seq in sequences {
            tokens.extend_from_slice(seq);
            tokens.resize(tokens.len() + (cols - seq.len()), PAD_ID);
        }
        Ok(Self { rows, cols, tokens })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    pub fn row(&self, index: usize) -> &[i64] {
        &self.tokens[index * self.cols..(index + 1) * self.cols]
    }
}

/// Length boundaries paired with batch sizes holding the per-batch token
/// budget roughly constant: boundary `i` carries batch size `max_tokens / i`.
#[derive(Debug, Clone)]
pub struct BucketSchedule {
    buckets: Vec<BucketSpec>,
    max_seq_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    pub boundary: usize,
    pub batch_size: usize,
}

impl BucketSchedule {
    /// Enumerates one bucket per divisor of `max_tokens` in `[1, max_seq_len]`.
    /// Boundaries are inclusive; anything longer than the largest boundary
    /// falls through to the batch-size-1 fallback.
    pub fn new(max_tokens: usize, max_seq_len: usize) -> Result<Self> {
        if max_tokens == 0 || max_seq_len == 0 {
            return Err(DatasetError::InvalidConfig(
                "bucket schedule requires max_tokens > 0 and max_seq_len > 0".into(),
            ));
        }
        let buckets: Vec<BucketSpec> = (1..=max_seq_len)
            .filter(|boundary| max_tokens % boundary == 0)
            .map(|boundary| BucketSpec {
                boundary,
                batch_size: max_tokens / boundary,
            })
            .collect();
        Ok(Self {
            buckets,
            max_seq_len,
        })
    }

    pub fn buckets(&self) -> &[BucketSpec] {
        &self.buckets
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Index of the smallest bucket whose boundary fits `len`, or
    /// `buckets().len()` for the fallback bucket.
    pub fn route(&self, len: usize) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.boundary >= len)
            .unwrap_or(self.buckets.len())
    }

    pub fn batch_size_for(&self, len: usize) -> usize {
        let index = self.route(len);
        if index == self.buckets.len() {
            1
        } else {
            self.buckets[index].batch_size
        }
    }
}

/// Accumulates sequences per bucket and emits a batch whenever one fills.
#[derive(Debug)]
pub struct BucketedBatcher {
    schedule: BucketSchedule,
    pending: Vec<Vec<Vec<i64>>>,
}

impl BucketedBatcher {
    pub fn new(schedule: BucketSchedule) -> Self {
        let pending = vec![Vec::new(); schedule.buckets().len() + 1];
        Self { schedule, pending }
    }

    pub fn schedule(&self) -> &BucketSchedule {
        &self.schedule
    }

    /// Routes a sequence; returns a full batch when its bucket reaches the
    /// bucket's batch size.
    pub fn push(&mut self, sequence: Vec<i64>) -> Result<Option<Batch>> {
        let index = self.schedule.route(sequence.len());
        let batch_size = if index == self.schedule.buckets().len() {
            1
        } else {
            self.schedule.buckets()[index].batch_size
        };
        let slot = &mut self.pending[index];
        slot.push(sequence);
        if slot.len() >= batch_size {
            let sequences = std::mem::take(slot);
            return Batch::from_sequences(&sequences).map(Some);
        }
        Ok(None)
    }

    /// Drains every partially-filled bucket, largest boundary first.
    pub fn flush(&mut self) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        for slot in self.pending.iter_mut().rev() {
            if !slot.is_empty() {
                let sequences = std::mem::take(slot);
                batches.push(Batch::from_sequences(&sequences)?);
            }
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_pads_to_longest_sequence() {
        let batch =
            Batch::from_sequences(&[vec![1, 2, 3], vec![4], vec![5, 6]]).unwrap();
        assert_eq!(batch.rows(), 3);
        assert_eq!(batch.cols(), 3);
        assert_eq!(batch.row(0), &[1, 2, 3]);
        assert_eq!(batch.row(1), &[4, 0, 0]);
        assert_eq!(batch.row(2), &[5, 6, 0]);
    }

    #[test]
    fn schedule_enumerates_divisors() {
        let schedule = BucketSchedule::new(100, 600).unwrap();
        let boundaries: Vec<usize> = schedule.buckets().iter().map(|b| b.boundary).collect();
        assert_eq!(boundaries, vec![1, 2, 4, 5, 10, 20, 25, 50, 100]);
        for bucket in schedule.buckets() {
            assert_eq!(bucket.boundary * bucket.batch_size, 100);
        }
    }

    #[test]
    fn routes_to_smallest_fitting_boundary() {
        let schedule = BucketSchedule::new(100, 600).unwrap();
        // Length 10 fits boundary 10 exactly, so the batch size is 100 / 10.
        assert_eq!(schedule.batch_size_for(10), 10);
        assert_eq!(schedule.batch_size_for(3), 25);
        // Past the largest enumerated boundary everything is batch size 1.
        assert_eq!(schedule.batch_size_for(101), 1);
        assert_eq!(schedule.batch_size_for(601), 1);
    }

    #[test]
    fn batcher_emits_when_bucket_fills() {
        let schedule = BucketSchedule::new(4, 4).unwrap();
        let mut batcher = BucketedBatcher::new(schedule);

        // Boundary 2 has batch size 2.
        assert!(batcher.push(vec![1, 2]).unwrap().is_none());
        let batch = batcher.push(vec![3]).unwrap().expect("bucket full");
        assert_eq!(batch.rows(), 2);
        assert_eq!(batch.row(1), &[3, 0]);
    }

    #[test]
    fn oversized_sequences_emit_alone() {
        let schedule = BucketSchedule::new(4, 4).unwrap();
        let mut batcher = BucketedBatcher::new(schedule);
        let batch = batcher
            .push(vec![1; 9])
            .unwrap()
            .expect("fallback emits immediately");
        assert_eq!(batch.rows(), 1);
        assert_eq!(batch.cols(), 9);
    }

    #[test]
    fn flush_drains_partial_buckets() {
        let schedule = BucketSchedule::new(4, 4).unwrap();
        let mut batcher = BucketedBatcher::new(schedule);
        assert!(batcher.push(vec![1, 2]).unwrap().is_none());
        assert!(batcher.push(vec![1, 2, 3]).unwrap().is_none());
        let batches = batcher.flush().unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batcher.flush().unwrap().is_empty());
    }
}

//! Dataset pipeline: record readers, batching strategies and the
//! prefix-augmentation variant used for noun-chunk conditioning.

pub mod batching;
pub mod errors;
pub mod pipeline;
pub mod prefix;
pub mod records;

pub use batching::{Batch, BucketSchedule, BucketedBatcher};
pub use errors::{DatasetError, Result};
pub use pipeline::{
    bucketed_training_batches, evaluation_batches, training_batches, BatchStream, PipelineConfig,
    SequenceSource,
};
pub use prefix::{AnalyzerProcess, NounChunkAnalyzer, PrefixConfig, PrefixedSource};
pub use records::{JsonlSource, RecordFileSource, RecordFileWriter};

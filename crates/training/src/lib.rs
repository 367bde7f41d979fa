pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod evaluate;
pub mod logging;
pub mod loss;
pub mod masks;
pub mod metrics;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManager, TrainingCounters};
pub use config::{TrainingConfig, TrainingError};
pub use decode::{
    decode_encoded, GreedyStrategy, RandomSamplingStrategy, SamplingStrategy, TopKSamplingStrategy,
};
pub use evaluate::{evaluate_checkpoint, wait_for_newer_checkpoint, EvaluationOptions, EvaluationReport};
pub use loss::{LossMetrics, LossOutput, MaskedCrossEntropy};
pub use metrics::{EvaluationMetrics, EvaluationSummary, TrainingMetrics};
pub use optimizer::{OptimizerState, TrainerOptimizer};
pub use schedule::{ConstantSchedule, LearningRateSchedule, TransformerSchedule};
pub use trainer::{select_device, Trainer};

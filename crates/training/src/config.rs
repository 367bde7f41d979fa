use std::{fmt, path::PathBuf};

use model::ModelConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.path.as_os_str().is_empty() {
            errors.push("data.path must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if let Some(bucketing) = &self.data.bucketing {
            if bucketing.max_tokens == 0 {
                errors.push("data.bucketing.max_tokens must be greater than 0".to_string());
            }
            if bucketing.max_seq_len == 0 {
                errors.push("data.bucketing.max_seq_len must be greater than 0".to_string());
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let ScheduleKind::TransformerWarmup = self.schedule.strategy {
            if self.schedule.warmup_steps == 0 {
                errors.push("schedule.warmup_steps must be greater than 0".to_string());
            }
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.summarize_every_n_steps == 0 {
            errors.push("runtime.summarize_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if self.runtime.checkpoint.every_n_steps == 0 {
            errors.push("runtime.checkpoint.every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.max_keep == 0 {
            errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
        }

        if self.model.hidden_size == 0 || self.model.num_layers == 0 || self.model.ff_size == 0 {
            errors.push("model dimensions must be greater than 0".to_string());
        }

        if self.model.num_heads == 0 || self.model.hidden_size % self.model.num_heads != 0 {
            errors.push("model.hidden_size must be divisible by model.num_heads".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub path: PathBuf,
    pub vocab: PathBuf,
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_shuffle_buffer")]
    pub shuffle_buffer: usize,
    #[serde(default)]
    pub bucketing: Option<BucketingConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Jsonl,
    Records,
}

impl Default for DataFormat {
    fn default() -> Self {
        Self::Jsonl
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Jsonl => write!(f, "jsonl"),
            DataFormat::Records => write!(f, "records"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketingConfig {
    pub max_tokens: usize,
    pub max_seq_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_ff_size")]
    pub ff_size: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            ff_size: default_ff_size(),
            max_seq_len: default_max_seq_len(),
            dropout: None,
        }
    }
}

impl ModelSettings {
    pub fn to_model_config(&self, vocab_size: usize) -> ModelConfig {
        ModelConfig {
            vocab_size,
            hidden_dim: self.hidden_size,
            n_layers: self.num_layers,
            n_heads: self.num_heads,
            ff_dim: self.ff_size,
            max_seq_len: self.max_seq_len,
            dropout_p: self.dropout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Sgd,
    Adam,
}

impl Default for OptimizerType {
    fn default() -> Self {
        Self::Sgd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub strategy: ScheduleKind,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
    /// Multiplier for the warmup schedule; defaults to `hidden_size^-0.5`.
    #[serde(default)]
    pub scale: Option<f64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            strategy: ScheduleKind::default(),
            warmup_steps: default_warmup_steps(),
            scale: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Constant,
    TransformerWarmup,
}

impl Default for ScheduleKind {
    fn default() -> Self {
        Self::Constant
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: u64,
    #[serde(default = "default_summarize_every_n_steps")]
    pub summarize_every_n_steps: u64,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub events_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_steps: u64,
    #[serde(default = "default_max_keep")]
    pub max_keep: usize,
    /// When false the loop terminates after its first checkpoint.
    #[serde(default = "default_continuous")]
    pub continuous: bool,
}

fn default_batch_size() -> usize {
    1
}

fn default_shuffle_buffer() -> usize {
    100
}

fn default_hidden_size() -> usize {
    128
}

fn default_num_layers() -> usize {
    2
}

fn default_num_heads() -> usize {
    4
}

fn default_ff_size() -> usize {
    512
}

fn default_max_seq_len() -> usize {
    512
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.98
}

fn default_adam_eps() -> f64 {
    1e-9
}

fn default_warmup_steps() -> u64 {
    4000
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> u64 {
    100
}

fn default_summarize_every_n_steps() -> u64 {
    1
}

fn default_checkpoint_every() -> u64 {
    1000
}

fn default_max_keep() -> usize {
    5
}

fn default_continuous() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Data(dataset::DatasetError),
    Vocab(vocab::VocabError),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "IO error: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Data(err) => write!(f, "data pipeline failed: {}", err),
            TrainingError::Vocab(err) => write!(f, "vocabulary failed: {}", err),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Data(err) => Some(err),
            TrainingError::Vocab(err) => Some(err),
            TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<dataset::DatasetError> for TrainingError {
    fn from(value: dataset::DatasetError) -> Self {
        TrainingError::Data(value)
    }
}

impl From<vocab::VocabError> for TrainingError {
    fn from(value: vocab::VocabError) -> Self {
        TrainingError::Vocab(value)
    }
}

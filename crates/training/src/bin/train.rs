use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use dataset::{
    bucketed_training_batches, training_batches, BatchStream, BucketSchedule, JsonlSource,
    PipelineConfig, RecordFileSource,
};
use model::DecoderModel;
use training::{
    config::{
        BucketingConfig, CheckpointConfig, DataConfig, DataFormat, ModelSettings,
        OptimizerConfig, OptimizerType, RuntimeConfig, ScheduleConfig,
    },
    select_device, Trainer, TrainingConfig, TrainingError,
};
use vocab::Vocabulary;

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Language model training", long_about = None)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Training data file")]
    data: PathBuf,

    #[arg(long, value_name = "PATH", help = "Vocabulary file")]
    vocab: PathBuf,

    #[arg(long, value_name = "PATH", help = "Checkpoint directory")]
    checkpoint_path: PathBuf,

    #[arg(long, value_enum, default_value_t = DataFormat::Records, help = "Input record format")]
    format: DataFormat,

    #[arg(long, default_value_t = 1, help = "Batch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 100, help = "Shuffle buffer")]
    shuffle_buffer: usize,

    #[arg(long, default_value_t = 1000, help = "Checkpoint every X steps")]
    checkpoint_every: u64,

    #[arg(long, default_value_t = 1, help = "Summarize model stats every X steps")]
    summarize_every: u64,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Whether to continue training after checkpointing"
    )]
    continuous: bool,

    #[arg(long, default_value_t = 0.01, help = "Learning rate")]
    learning_rate: f64,

    #[arg(
        long,
        help = "Token budget per batch; enables sequence-length bucketing"
    )]
    max_tokens: Option<usize>,

    #[arg(long, default_value_t = 600, help = "Largest bucketed sequence length")]
    max_seq_len: usize,

    #[arg(long, default_value_t = 128, help = "Model hidden size")]
    hidden_size: usize,

    #[arg(long, default_value_t = 2, help = "Number of decoder layers")]
    num_layers: usize,

    #[arg(long, default_value_t = 4, help = "Number of attention heads")]
    num_heads: usize,

    #[arg(long, default_value_t = 512, help = "Feed-forward width")]
    ff_size: usize,

    #[arg(long, default_value_t = 512, help = "Model context length")]
    context_len: usize,

    #[arg(long, default_value_t = 42, help = "Shuffle seed")]
    seed: u64,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let vocabulary = Vocabulary::from_path(&args.vocab)?;
    let device = select_device();

    let config = TrainingConfig {
        data: DataConfig {
            path: args.data.clone(),
            vocab: args.vocab.clone(),
            format: args.format,
            batch_size: args.batch_size,
            shuffle_buffer: args.shuffle_buffer,
            bucketing: args.max_tokens.map(|max_tokens| BucketingConfig {
                max_tokens,
                max_seq_len: args.max_seq_len,
            }),
        },
        model: ModelSettings {
            hidden_size: args.hidden_size,
            num_layers: args.num_layers,
            num_heads: args.num_heads,
            ff_size: args.ff_size,
            max_seq_len: args.context_len,
            dropout: None,
        },
        optimizer: OptimizerConfig {
            algorithm: OptimizerType::Sgd,
            learning_rate: args.learning_rate,
            ..OptimizerConfig::default()
        },
        schedule: ScheduleConfig::default(),
        runtime: RuntimeConfig {
            seed: args.seed,
            log_every_n_steps: 100,
            summarize_every_n_steps: args.summarize_every,
            checkpoint: CheckpointConfig {
                directory: args.checkpoint_path.clone(),
                every_n_steps: args.checkpoint_every,
                max_keep: 5,
                continuous: args.continuous,
            },
            events_dir: None,
        },
    };

    let model = DecoderModel::new(
        config.model.to_model_config(vocabulary.vocab_size()),
        device.clone(),
    )
    .map_err(|err| TrainingError::initialization(err.to_string()))?;

    let mut trainer = Trainer::new(config.clone(), model, device, None)?;
    trainer.resume_from_latest()?;

    // Skip batches the previous run already consumed.
    let skip = trainer.counters().global_step;
    let batches = build_batches(&config, skip)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(batches, || shutdown_flag.load(Ordering::Relaxed))?;

    Ok(())
}

fn build_batches(config: &TrainingConfig, skip: u64) -> Result<BatchStream, TrainingError> {
    let pipeline = PipelineConfig {
        batch_size: config.data.batch_size,
        shuffle_buffer: config.data.shuffle_buffer,
        seed: config.runtime.seed,
    };
    let stream = match (&config.data.bucketing, config.data.format) {
        (Some(bucketing), DataFormat::Jsonl) => bucketed_training_batches(
            JsonlSource::new(&config.data.path),
            BucketSchedule::new(bucketing.max_tokens, bucketing.max_seq_len)?,
            pipeline,
            skip,
        )?,
        (Some(bucketing), DataFormat::Records) => bucketed_training_batches(
            RecordFileSource::new(&config.data.path),
            BucketSchedule::new(bucketing.max_tokens, bucketing.max_seq_len)?,
            pipeline,
            skip,
        )?,
        (None, DataFormat::Jsonl) => {
            training_batches(JsonlSource::new(&config.data.path), pipeline, skip)?
        }
        (None, DataFormat::Records) => {
            training_batches(RecordFileSource::new(&config.data.path), pipeline, skip)?
        }
    };
    Ok(stream)
}

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use dataset::{
    training_batches, AnalyzerProcess, PipelineConfig, PrefixConfig, PrefixedSource,
};
use model::DecoderModel;
use training::{
    config::{
        CheckpointConfig, DataConfig, DataFormat, ModelSettings, OptimizerConfig, OptimizerType,
        RuntimeConfig, ScheduleConfig, ScheduleKind,
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
#[command(
    author,
    version,
    about = "Language model training with noun-chunk conditioning prefixes",
    long_about = None
)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Training data file (one article per line)")]
    data: PathBuf,

    #[arg(long, value_name = "PATH", help = "Vocabulary file")]
    vocab: PathBuf,

    #[arg(long, value_name = "PATH", help = "Checkpoint directory")]
    checkpoint_path: PathBuf,

    #[arg(
        long,
        value_name = "PROGRAM",
        help = "Noun-chunk analyzer command; paragraphs in, JSON chunk arrays out"
    )]
    analyzer_cmd: String,

    #[arg(
        long = "analyzer-arg",
        value_name = "ARG",
        help = "Argument passed to the analyzer command (repeatable)"
    )]
    analyzer_args: Vec<String>,

    #[arg(long, default_value = "~", help = "Separator token for chunk prefixes")]
    separator: String,

    #[arg(long, default_value_t = 100, help = "Batch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 1, help = "Shuffle buffer")]
    shuffle_buffer: usize,

    #[arg(long, default_value_t = 1000, help = "Checkpoint every X steps")]
    checkpoint_every: u64,

    #[arg(long, default_value_t = 1, help = "Summarize model stats every X steps")]
    summarize_every: u64,

    #[arg(long, default_value_t = 4000, help = "Warmup steps for the learning-rate schedule")]
    warmup_steps: u64,

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

    let vocabulary = Arc::new(Vocabulary::from_path(&args.vocab)?);
    let device = select_device();

    let config = TrainingConfig {
        data: DataConfig {
            path: args.data.clone(),
            vocab: args.vocab.clone(),
            format: DataFormat::Jsonl,
            batch_size: args.batch_size,
            shuffle_buffer: args.shuffle_buffer,
            bucketing: None,
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
            algorithm: OptimizerType::Adam,
            // Base rate is unused by the warmup schedule but must validate.
            learning_rate: 1.0,
            ..OptimizerConfig::default()
        },
        schedule: ScheduleConfig {
            strategy: ScheduleKind::TransformerWarmup,
            warmup_steps: args.warmup_steps,
            scale: None,
        },
        runtime: RuntimeConfig {
            seed: args.seed,
            log_every_n_steps: 100,
            summarize_every_n_steps: args.summarize_every,
            checkpoint: CheckpointConfig {
                directory: args.checkpoint_path.clone(),
                every_n_steps: args.checkpoint_every,
                max_keep: 5,
                continuous: true,
            },
            events_dir: None,
        },
    };

    let analyzer = AnalyzerProcess::spawn(&args.analyzer_cmd, &args.analyzer_args)?;
    let source = PrefixedSource::new(
        &args.data,
        Arc::clone(&vocabulary),
        analyzer,
        PrefixConfig {
            separator: args.separator.clone(),
            ..PrefixConfig::default()
        },
    );

    let model = DecoderModel::new(
        config.model.to_model_config(vocabulary.vocab_size()),
        device.clone(),
    )
    .map_err(|err| TrainingError::initialization(err.to_string()))?;

    let mut trainer = Trainer::new(
        config.clone(),
        model,
        device,
        Some(vocabulary.start_idx()),
    )?;
    trainer.resume_from_latest()?;

    let skip = trainer.counters().global_step;
    let batches = training_batches(
        source,
        PipelineConfig {
            batch_size: config.data.batch_size,
            shuffle_buffer: config.data.shuffle_buffer,
            seed: config.runtime.seed,
        },
        skip,
    )?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(batches, || shutdown_flag.load(Ordering::Relaxed))?;

    Ok(())
}

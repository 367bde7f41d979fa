use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use clap::Parser;
use model::DecoderModel;
use training::{
    checkpoint::{restore_model_weights, CheckpointManager},
    config::{DataFormat, ModelSettings},
    evaluate_checkpoint,
    logging::{Logger, LoggingSettings},
    select_device, wait_for_newer_checkpoint, EvaluationOptions, TrainingError,
};
use vocab::Vocabulary;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    if let Err(err) = run() {
        eprintln!("evaluation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Language model evaluation", long_about = None)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Evaluation data file")]
    data: PathBuf,

    #[arg(long, value_name = "PATH", help = "Vocabulary file")]
    vocab: PathBuf,

    #[arg(long, value_name = "PATH", help = "Model checkpoint directory")]
    checkpoint_path: PathBuf,

    #[arg(long, value_enum, default_value_t = DataFormat::Jsonl, help = "Input record format")]
    format: DataFormat,

    #[arg(long, default_value_t = 1, help = "Batch size")]
    batch_size: usize,

    #[arg(long, help = "Evaluate only X batches from a shuffled view")]
    take: Option<u64>,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Shuffle buffer; only used when --take is set"
    )]
    shuffle_buffer: usize,

    #[arg(long, help = "Whether to wait for the next checkpoint when done")]
    wait_for_checkpoint: bool,

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

    #[arg(long, default_value_t = 42, help = "Sampling seed")]
    seed: u64,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let vocabulary = Vocabulary::from_path(&args.vocab)?;
    let device = select_device();

    let settings = ModelSettings {
        hidden_size: args.hidden_size,
        num_layers: args.num_layers,
        num_heads: args.num_heads,
        ff_size: args.ff_size,
        max_seq_len: args.context_len,
        dropout: None,
    };
    let model = DecoderModel::new(
        settings.to_model_config(vocabulary.vocab_size()),
        device.clone(),
    )
    .map_err(|err| TrainingError::initialization(err.to_string()))?;

    let manager = CheckpointManager::new(&args.checkpoint_path, 5);
    // Evaluating an untrained model is never silently permitted.
    let mut descriptor = manager.latest()?.ok_or_else(|| {
        TrainingError::runtime(format!(
            "no checkpoint found under {}",
            args.checkpoint_path.display()
        ))
    })?;

    let stem = args
        .data
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let events_dir = args.checkpoint_path.join(format!("{stem}_eval"));
    let mut logger = Logger::new(LoggingSettings::new(Some(events_dir), 1))?;

    let mut options = EvaluationOptions::new(&args.data, args.format);
    options.batch_size = args.batch_size;
    options.take = args.take;
    options.shuffle_buffer = args.shuffle_buffer;
    options.seed = args.seed;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    loop {
        restore_model_weights(&model, &descriptor.directory)?;
        println!(
            "starting evaluation of checkpoint '{}'",
            descriptor.directory.display()
        );
        let start = Instant::now();

        let report =
            evaluate_checkpoint(&model, &vocabulary, &descriptor, &options, &device, &mut logger)?;

        println!(
            "evaluation of checkpoint '{}' finished in {:.1}s",
            descriptor.directory.display(),
            start.elapsed().as_secs_f64()
        );
        let json = serde_json::to_string(&report)
            .map_err(|err| TrainingError::runtime(format!("failed to render report: {err}")))?;
        println!("{json}");

        if !args.wait_for_checkpoint {
            break;
        }
        match wait_for_newer_checkpoint(&manager, report.global_step, POLL_INTERVAL, &|| {
            cancel_flag.load(Ordering::Relaxed)
        })? {
            Some(newer) => descriptor = newer,
            None => break,
        }
    }

    Ok(())
}

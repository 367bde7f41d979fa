use std::{fs, io::Write, path::Path, path::PathBuf};

use candle_core::Device;
use model::DecoderModel;
use tempfile::tempdir;
use training::{
    checkpoint::{restore_model_weights, CheckpointManager},
    config::{
        CheckpointConfig, DataConfig, DataFormat, ModelSettings, OptimizerConfig, OptimizerType,
        RuntimeConfig, ScheduleConfig,
    },
    evaluate_checkpoint,
    logging::{Logger, LoggingSettings},
    EvaluationOptions, Trainer, TrainingConfig,
};
use vocab::Vocabulary;

const VOCAB_SIZE: usize = 16;

fn write_corpus(path: &Path) {
    let mut file = fs::File::create(path).unwrap();
    let sequences: &[&[i64]] = &[
        &[1, 5, 6, 7, 2],
        &[1, 8, 9, 2],
        &[1, 10, 11, 12, 13, 2],
        &[1, 6, 9, 12, 2],
        &[1, 7, 7, 8, 2],
        &[1, 13, 5, 2],
    ];
    for seq in sequences {
        let encoded: Vec<String> = seq.iter().map(|id| id.to_string()).collect();
        writeln!(file, r#"{{"encoded": [{}]}}"#, encoded.join(", ")).unwrap();
    }
}

fn write_vocab(path: &Path) {
    let mut tokens = vec![
        "<pad>".to_string(),
        "<s>".to_string(),
        "</s>".to_string(),
        "<unk>".to_string(),
    ];
    for i in tokens.len()..VOCAB_SIZE {
        tokens.push(format!("word{}", i));
    }
    fs::write(path, serde_json::to_string(&tokens).unwrap()).unwrap();
}

fn build_config(
    base: &Path,
    data: PathBuf,
    vocab: PathBuf,
    checkpoint_every: u64,
    continuous: bool,
) -> TrainingConfig {
    TrainingConfig {
        data: DataConfig {
            path: data,
            vocab,
            format: DataFormat::Jsonl,
            batch_size: 2,
            shuffle_buffer: 4,
            bucketing: None,
        },
        model: ModelSettings {
            hidden_size: 16,
            num_layers: 1,
            num_heads: 2,
            ff_size: 32,
            max_seq_len: 16,
            dropout: None,
        },
        optimizer: OptimizerConfig {
            algorithm: OptimizerType::Sgd,
            learning_rate: 0.05,
            ..OptimizerConfig::default()
        },
        schedule: ScheduleConfig::default(),
        runtime: RuntimeConfig {
            seed: 42,
            log_every_n_steps: 100,
            summarize_every_n_steps: 1,
            checkpoint: CheckpointConfig {
                directory: base.join("checkpoints"),
                every_n_steps: checkpoint_every,
                max_keep: 5,
                continuous,
            },
            events_dir: Some(base.join("events")),
        },
    }
}

fn build_trainer(config: TrainingConfig) -> Trainer<DecoderModel> {
    let model = DecoderModel::new(
        config.model.to_model_config(VOCAB_SIZE),
        Device::Cpu,
    )
    .unwrap();
    Trainer::new(config, model, Device::Cpu, None).unwrap()
}

fn batches(config: &TrainingConfig, skip: u64) -> dataset::BatchStream {
    dataset::training_batches(
        dataset::JsonlSource::new(&config.data.path),
        dataset::PipelineConfig {
            batch_size: config.data.batch_size,
            shuffle_buffer: config.data.shuffle_buffer,
            seed: config.runtime.seed,
        },
        skip,
    )
    .unwrap()
}

#[test]
fn single_shot_checkpoint_then_resume() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("train.jsonl");
    let vocab_path = tmp.path().join("vocab.json");
    write_corpus(&data);
    write_vocab(&vocab_path);

    let config = build_config(tmp.path(), data, vocab_path, 3, false);
    let mut trainer = build_trainer(config.clone());
    trainer.train(batches(&config, 0)).unwrap();

    // Single-checkpoint mode stops right after the first save.
    let counters = trainer.counters();
    assert_eq!(counters.global_step, 3);
    assert_eq!(counters.examples_processed, 6);

    // A fresh process restores the exact persisted counters.
    let mut resumed = build_trainer(config.clone());
    let descriptor = resumed
        .resume_from_latest()
        .unwrap()
        .expect("latest checkpoint");
    assert_eq!(descriptor.manifest.counters.global_step, 3);
    assert_eq!(resumed.counters().global_step, 3);
    assert_eq!(resumed.counters().examples_processed, 6);
}

#[test]
fn retention_keeps_only_the_five_most_recent() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("train.jsonl");
    let vocab_path = tmp.path().join("vocab.json");
    write_corpus(&data);
    write_vocab(&vocab_path);

    let config = build_config(tmp.path(), data, vocab_path, 1, true);
    let mut trainer = build_trainer(config.clone());
    // Seven saves against a retention bound of five.
    trainer.train(batches(&config, 0).take(7)).unwrap();

    let checkpoint_dir = config.runtime.checkpoint.directory.clone();
    let mut kept: Vec<String> = fs::read_dir(&checkpoint_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("step_"))
        .collect();
    kept.sort();
    assert_eq!(
        kept,
        (3..=7)
            .map(|step| format!("step_{:012}", step))
            .collect::<Vec<_>>()
    );

    let manager = CheckpointManager::new(&checkpoint_dir, 5);
    let latest = manager.latest().unwrap().unwrap();
    assert_eq!(latest.manifest.counters.global_step, 7);
}

#[test]
fn evaluation_restores_weights_and_reports() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("valid.jsonl");
    let vocab_path = tmp.path().join("vocab.json");
    write_corpus(&data);
    write_vocab(&vocab_path);

    let config = build_config(tmp.path(), data.clone(), vocab_path.clone(), 3, false);
    let mut trainer = build_trainer(config.clone());
    trainer.train(batches(&config, 0)).unwrap();

    let vocabulary = Vocabulary::from_path(&vocab_path).unwrap();
    let manager = CheckpointManager::new(&config.runtime.checkpoint.directory, 5);
    let descriptor = manager.latest().unwrap().expect("checkpoint");

    let model = DecoderModel::new(
        config.model.to_model_config(VOCAB_SIZE),
        Device::Cpu,
    )
    .unwrap();
    restore_model_weights(&model, &descriptor.directory).unwrap();

    let events_dir = tmp.path().join("valid_eval");
    let mut logger = Logger::new(LoggingSettings::new(Some(events_dir.clone()), 1)).unwrap();

    let mut options = EvaluationOptions::new(&data, DataFormat::Jsonl);
    options.batch_size = 2;
    options.shuffle_buffer = 8;
    options.max_decode_len = 8;

    let report = evaluate_checkpoint(
        &model,
        &vocabulary,
        &descriptor,
        &options,
        &Device::Cpu,
        &mut logger,
    )
    .unwrap();

    assert_eq!(report.global_step, 3);
    assert_eq!(report.samples.len(), 5);
    assert!((0.0..=1.0).contains(&report.token_accuracy));
    assert!(report.log_perplexity > 0.0);
    assert!(report.tokens > 0);

    let produced: Vec<_> = fs::read_dir(&events_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .collect();
    assert!(!produced.is_empty(), "no event files written");
}

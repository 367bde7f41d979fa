//! Checkpoint persistence.
//!
//! A checkpoint binds model weights, optimizer state and the progress
//! counters into one step-named directory. The manifest is written last, so
//! a concurrent reader either sees a complete checkpoint or none at all;
//! restoring validates every component checksum and fails as a whole when
//! any of them is missing or corrupt.

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::SequenceModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{optimizer::OptimizerState, TrainerOptimizer, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Progress counters that survive process restarts. Owned by the training
/// loop and passed by reference; persisted inside the manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingCounters {
    /// Number of completed gradient updates.
    pub global_step: u64,
    /// Cumulative examples consumed; purely observational.
    pub examples_processed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub counters: TrainingCounters,
}

pub struct SaveRequest<'a> {
    pub config: &'a TrainingConfig,
    pub model: &'a dyn SequenceModel,
    pub optimizer: &'a TrainerOptimizer,
    pub counters: TrainingCounters,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub model_weights_path: PathBuf,
}

/// Bounded, ordered checkpoint history under one base directory.
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_keep: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>, max_keep: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_keep,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save(&self, request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
        fs::create_dir_all(&self.base_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.base_dir.display()
            ))
        })?;

        let dir_name = format!("step_{:012}", request.counters.global_step);
        let checkpoint_dir = self.base_dir.join(dir_name);
        if checkpoint_dir.exists() {
            fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to remove existing checkpoint directory {}: {err}",
                    checkpoint_dir.display()
                ))
            })?;
        }
        fs::create_dir(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;

        let model_path = checkpoint_dir.join(MODEL_FILENAME);
        save_model_weights(request.model, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_state = request.optimizer.state()?;
        let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &optimizer_state)?;
        let optimizer_record = file_record(&optimizer_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: fingerprint_config(request.config)?,
            model: model_record,
            optimizer: optimizer_record,
            counters: request.counters,
        };

        // The manifest lands last: its presence marks the save complete.
        let manifest_path = checkpoint_dir.join(MANIFEST_FILENAME);
        write_json(&manifest_path, &manifest)?;

        self.prune()?;

        Ok(CheckpointDescriptor {
            directory: checkpoint_dir,
            manifest,
        })
    }

    pub fn latest(&self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let entries = self.checkpoint_directories()?;
        let Some(path) = entries.into_iter().max() else {
            return Ok(None);
        };
        let manifest = load_manifest(&path)?;
        Ok(Some(CheckpointDescriptor {
            directory: path,
            manifest,
        }))
    }

    pub fn load(&self, directory: &Path) -> Result<LoadOutcome, TrainingError> {
        let manifest = load_manifest(directory)?;
        ensure_version_supported(manifest.version)?;

        let model_path = directory.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model.sha256)?;

        let optimizer_path = directory.join(&manifest.optimizer.filename);
        validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
        let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

        Ok(LoadOutcome {
            manifest,
            optimizer_state,
            model_weights_path: model_path,
        })
    }

    /// Only directories with a manifest count: a save in progress is
    /// invisible until its manifest lands.
    fn checkpoint_directories(&self) -> Result<Vec<PathBuf>, TrainingError> {
        let mut dirs = Vec::new();
        if !self.base_dir.exists() {
            return Ok(dirs);
        }
        for entry in fs::read_dir(&self.base_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read checkpoint directory {}: {err}",
                self.base_dir.display()
            ))
        })? {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("step_") && path.join(MANIFEST_FILENAME).is_file() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    fn prune(&self) -> Result<(), TrainingError> {
        if self.max_keep == 0 {
            return Ok(());
        }
        let mut dirs = self.checkpoint_directories()?;
        dirs.sort();
        while dirs.len() > self.max_keep {
            let victim = dirs.remove(0);
            fs::remove_dir_all(&victim).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to prune checkpoint {}: {err}",
                    victim.display()
                ))
            })?;
        }
        Ok(())
    }
}

/// Loads the persisted weights into the model. Used by both the training
/// resume path and the evaluation loop, which does not need optimizer state.
pub fn restore_model_weights(
    model: &dyn SequenceModel,
    directory: &Path,
) -> Result<(), TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;
    let weights_path = directory.join(&manifest.model.filename);
    validate_file(&weights_path, &manifest.model.sha256)?;
    apply_model_weights(model, &weights_path)
}

pub(crate) fn apply_model_weights(
    model: &dyn SequenceModel,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let parameters = model.parameters();
    let device = parameters
        .first()
        .map(|(_, var)| var.as_tensor().device().clone())
        .ok_or_else(|| TrainingError::runtime("model exposes no parameters to restore"))?;

    let tensors = load_safetensors(weights_path, &device).map_err(to_runtime_error)?;
    let mut by_name: std::collections::HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in parameters {
        let tensor = by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

fn save_model_weights(model: &dyn SequenceModel, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = std::collections::HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_manifest(step: u64) -> CheckpointManifest {
        let record = FileRecord {
            filename: "x".into(),
            sha256: "0".into(),
            bytes: 0,
        };
        CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: 0,
            config_sha256: String::new(),
            model: record.clone(),
            optimizer: record,
            counters: TrainingCounters {
                global_step: step,
                examples_processed: step * 10,
            },
        }
    }

    #[test]
    fn latest_ignores_directories_without_a_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path(), 5);

        // A save in progress: directory exists, manifest not yet written.
        fs::create_dir(tmp.path().join("step_000000000009")).unwrap();
        assert!(manager.latest().unwrap().is_none());

        let complete = tmp.path().join("step_000000000003");
        fs::create_dir(&complete).unwrap();
        write_json(&complete.join(MANIFEST_FILENAME), &dummy_manifest(3)).unwrap();

        let descriptor = manager.latest().unwrap().expect("complete checkpoint");
        assert_eq!(descriptor.manifest.counters.global_step, 3);
    }

    #[test]
    fn latest_picks_the_highest_step() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path(), 5);
        for step in [2u64, 11, 7] {
            let dir = tmp.path().join(format!("step_{:012}", step));
            fs::create_dir(&dir).unwrap();
            write_json(&dir.join(MANIFEST_FILENAME), &dummy_manifest(step)).unwrap();
        }
        let descriptor = manager.latest().unwrap().unwrap();
        assert_eq!(descriptor.manifest.counters.global_step, 11);
    }

    #[test]
    fn counters_serialize_round_trip() {
        let counters = TrainingCounters {
            global_step: 42,
            examples_processed: 4200,
        };
        let json = serde_json::to_string(&counters).unwrap();
        let back: TrainingCounters = serde_json::from_str(&json).unwrap();
        assert_eq!(counters, back);
    }
}

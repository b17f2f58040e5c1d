use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::OptimizerKind;
use crate::model::GenericModel;
use crate::training::AttentionOptimizer;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0:?}")]
    Missing(PathBuf),
    #[error("checkpoint {path:?} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint holds {found} optimizer state but the run uses {expected}")]
    OptimizerMismatch {
        expected: OptimizerKind,
        found: OptimizerKind,
    },
    #[error("refusing to overwrite existing checkpoint {0:?}")]
    AlreadyExists(PathBuf),
}

/// Durable training cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Epochs fully completed.
    pub current_epoch: usize,
    /// Optimizer steps taken over the whole run.
    pub global_step: usize,
}

/// Where a run stands with respect to its snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    NoCheckpoint,
    Restored(TrainingProgress),
    Training,
    /// The last completed epoch has been persisted.
    Saved(usize),
}

/// Checkpoint metadata, written next to the model and optimizer records.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointData {
    pub epoch: usize,
    pub global_counter: usize,
    pub model_file: String,
    pub optimizer: OptimizerKind,
    pub optimizer_files: Vec<String>,
    pub timestamp: u64,
}

impl CheckpointData {
    pub fn progress(&self) -> TrainingProgress {
        TrainingProgress {
            current_epoch: self.epoch,
            global_step: self.global_counter,
        }
    }
}

/// `epoch_<N>`, where N counts completed epochs.
pub fn checkpoint_name(epoch: usize) -> String {
    format!("epoch_{}", epoch)
}

pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(checkpoint_name(epoch)).with_extension("json")
}

/// Persist model weights, optimizer state and progress after a completed epoch.
pub fn save_checkpoint<B: AutodiffBackend>(
    model: &GenericModel<B>,
    optimizer: &dyn AttentionOptimizer<B>,
    progress: TrainingProgress,
    checkpoint_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", checkpoint_dir))?;

    let name = checkpoint_name(progress.current_epoch);
    let metadata_path = checkpoint_path(checkpoint_dir, progress.current_epoch);
    if metadata_path.exists() {
        return Err(CheckpointError::AlreadyExists(metadata_path).into());
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let model_file = format!("{}_model", name);
    let model_path = checkpoint_dir.join(&model_file);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), model_path.clone())
        .with_context(|| "Failed to save model weights")?;

    let optimizer_files = optimizer.save(checkpoint_dir, &name)?;

    let checkpoint_data = CheckpointData {
        epoch: progress.current_epoch,
        global_counter: progress.global_step,
        model_file,
        optimizer: optimizer.kind(),
        optimizer_files,
        timestamp,
    };

    // Metadata last: a checkpoint is listed only once all of its records exist.
    let metadata_json = serde_json::to_string_pretty(&checkpoint_data)
        .with_context(|| "Failed to serialize checkpoint metadata")?;
    fs::write(&metadata_path, metadata_json)
        .with_context(|| format!("Failed to write checkpoint metadata: {:?}", metadata_path))?;

    info!(
        "Checkpoint saved at epoch {} (global step {}): {:?}",
        progress.current_epoch, progress.global_step, metadata_path
    );

    Ok(metadata_path)
}

pub fn read_checkpoint(checkpoint_path: &Path) -> Result<CheckpointData> {
    if !checkpoint_path.is_file() {
        return Err(CheckpointError::Missing(checkpoint_path.to_path_buf()).into());
    }
    let metadata_json = fs::read_to_string(checkpoint_path)
        .with_context(|| format!("Failed to read checkpoint file: {:?}", checkpoint_path))?;
    serde_json::from_str(&metadata_json).map_err(|source| {
        CheckpointError::Corrupt {
            path: checkpoint_path.to_path_buf(),
            source,
        }
        .into()
    })
}

/// Load model weights and optimizer state into the live objects.
pub fn load_checkpoint<B: AutodiffBackend>(
    checkpoint_path: &Path,
    model: GenericModel<B>,
    optimizer: &mut dyn AttentionOptimizer<B>,
    device: &B::Device,
) -> Result<(GenericModel<B>, TrainingProgress)> {
    let checkpoint_data = read_checkpoint(checkpoint_path)?;
    if checkpoint_data.optimizer != optimizer.kind() {
        return Err(CheckpointError::OptimizerMismatch {
            expected: optimizer.kind(),
            found: checkpoint_data.optimizer,
        }
        .into());
    }

    info!("Loading checkpoint from epoch {}", checkpoint_data.epoch);

    let checkpoint_dir = checkpoint_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint path"))?;

    let model_path = checkpoint_dir.join(&checkpoint_data.model_file);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(model_path.clone(), device)
        .with_context(|| format!("Failed to load model weights from: {:?}", model_path))?;
    let model = model.load_record(record);

    optimizer.load(checkpoint_dir, &checkpoint_data.optimizer_files, device)?;

    Ok((model, checkpoint_data.progress()))
}

/// List all available checkpoints in a directory as `(path, epoch, global step)`, by epoch.
pub fn list_checkpoints(checkpoint_dir: &Path) -> Result<Vec<(PathBuf, usize, usize)>> {
    if !checkpoint_dir.exists() {
        warn!("Checkpoint directory does not exist: {:?}", checkpoint_dir);
        return Ok(Vec::new());
    }

    let name_re = Regex::new(r"^epoch_(\d+)\.json$")?;
    let mut checkpoints = Vec::new();

    for entry in WalkDir::new(checkpoint_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|name| name_re.is_match(name));
        if !is_checkpoint {
            continue;
        }
        match read_checkpoint(path) {
            Ok(data) => checkpoints.push((path.to_path_buf(), data.epoch, data.global_counter)),
            Err(e) => warn!("Skipping checkpoint {:?}: {:#}", path, e),
        }
    }

    checkpoints.sort_by_key(|(_, epoch, _)| *epoch);

    Ok(checkpoints)
}

pub fn latest_checkpoint(checkpoint_dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_checkpoints(checkpoint_dir)?.pop().map(|(path, _, _)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackboneKind, ModelConfig, TrainingConfig};
    use crate::training::build_optimizer;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_model() -> GenericModel<TestBackend> {
        let config = ModelConfig {
            backbone: BackboneKind::Vgg16,
            num_classes: 3,
            base_width: 2,
            classifier_hidden: 4,
            attention_hidden: 2,
            ..ModelConfig::default()
        };
        GenericModel::new(&config, &Default::default()).unwrap()
    }

    #[test]
    fn test_list_empty_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoints = list_checkpoints(temp_dir.path()).unwrap();
        assert_eq!(checkpoints.len(), 0);
        assert_eq!(latest_checkpoint(temp_dir.path()).unwrap(), None);
    }

    #[test]
    fn test_save_then_list_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let model = tiny_model();
        let optimizer = build_optimizer::<TestBackend>(&TrainingConfig::default());

        for epoch in [1, 2, 10] {
            let progress = TrainingProgress {
                current_epoch: epoch,
                global_step: epoch * 7,
            };
            save_checkpoint(&model, optimizer.as_ref(), progress, temp_dir.path()).unwrap();
        }

        let listed = list_checkpoints(temp_dir.path()).unwrap();
        let epochs: Vec<usize> = listed.iter().map(|(_, e, _)| *e).collect();
        assert_eq!(epochs, vec![1, 2, 10]);

        let latest = latest_checkpoint(temp_dir.path()).unwrap().unwrap();
        assert_eq!(latest, checkpoint_path(temp_dir.path(), 10));

        let mut fresh_optimizer = build_optimizer::<TestBackend>(&TrainingConfig::default());
        let (_, progress) =
            load_checkpoint(&latest, tiny_model(), fresh_optimizer.as_mut(), &Default::default()).unwrap();
        assert_eq!(
            progress,
            TrainingProgress {
                current_epoch: 10,
                global_step: 70
            }
        );
    }

    #[test]
    fn test_existing_checkpoint_is_not_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        let model = tiny_model();
        let optimizer = build_optimizer::<TestBackend>(&TrainingConfig::default());
        let progress = TrainingProgress {
            current_epoch: 1,
            global_step: 3,
        };

        save_checkpoint(&model, optimizer.as_ref(), progress, temp_dir.path()).unwrap();
        let err = save_checkpoint(&model, optimizer.as_ref(), progress, temp_dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_missing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_checkpoint(&temp_dir.path().join("epoch_3.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::Missing(_))
        ));
    }

    #[test]
    fn test_optimizer_kind_must_match() {
        let temp_dir = TempDir::new().unwrap();
        let model = tiny_model();
        let sgd = build_optimizer::<TestBackend>(&TrainingConfig::default());
        let path = save_checkpoint(&model, sgd.as_ref(), TrainingProgress::default(), temp_dir.path()).unwrap();

        let mut adamw = build_optimizer::<TestBackend>(&TrainingConfig {
            optimizer: OptimizerKind::AdamW,
            ..TrainingConfig::default()
        });
        let err = load_checkpoint(&path, tiny_model(), adamw.as_mut(), &Default::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::OptimizerMismatch { .. })
        ));
    }

    #[test]
    fn test_unrelated_json_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("train_record.json"), "{}").unwrap();
        fs::write(temp_dir.path().join("epoch_4.json"), "not json").unwrap();
        assert!(list_checkpoints(temp_dir.path()).unwrap().is_empty());
    }
}

use anyhow::Result;
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::summary::SummaryWriter;
use super::trainer::SaliencyTrainer;
use crate::checkpoint::{checkpoint_path, latest_checkpoint, CheckpointError, TrainingProgress};
use crate::config::RunConfig;
use crate::data::{Augment, DataLoader, ImageListLoader, SyntheticDataLoader};
use crate::model::GenericModel;

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub progress: TrainingProgress,
    pub optimizer_steps: usize,
    pub checkpoints: Vec<PathBuf>,
    /// The restored checkpoint already covered every epoch.
    pub already_complete: bool,
}

/// Resolve which checkpoint to resume from, if any.
///
/// An explicit path must exist; otherwise the newest `epoch_N` in the
/// snapshot directory is used when present.
fn resume_target(config: &RunConfig, snapshot_dir: &Path) -> Result<Option<PathBuf>> {
    match &config.training.restore_from {
        Some(path) if path.is_file() => Ok(Some(path.clone())),
        Some(path) => Err(CheckpointError::Missing(path.clone()).into()),
        None => latest_checkpoint(snapshot_dir),
    }
}

/// Checkpoints are never overwritten, so every epoch still to run needs a free slot.
fn ensure_free_slots(snapshot_dir: &Path, progress: TrainingProgress, total_epoch: usize) -> Result<()> {
    for epoch in progress.current_epoch + 1..=total_epoch {
        let path = checkpoint_path(snapshot_dir, epoch);
        if path.exists() {
            return Err(CheckpointError::AlreadyExists(path).into());
        }
    }
    Ok(())
}

fn build_loader<B: AutodiffBackend>(
    config: &RunConfig,
    train_list: &Path,
    device: &B::Device,
) -> Result<Box<dyn DataLoader<B>>> {
    let training = &config.training;
    let loader: Box<dyn DataLoader<B>> = match training.synthetic_steps {
        Some(steps) => {
            info!("Using {} synthetic batches per epoch", steps);
            Box::new(SyntheticDataLoader::<B>::new(
                training.batch_size,
                training.crop_size,
                config.model.num_classes,
                steps,
                training.seed,
                device.clone(),
            ))
        }
        None => Box::new(ImageListLoader::<B>::from_list(
            train_list,
            &config.paths.img_dir,
            config.model.num_classes,
            training.batch_size,
            Augment {
                input_size: training.input_size,
                crop_size: training.crop_size,
            },
            training.num_workers,
            training.seed,
            device.clone(),
        )?),
    };
    Ok(loader)
}

/// Full training run: assemble, resume, train the remaining epochs.
pub fn train<B: AutodiffBackend>(config: RunConfig, device: &B::Device) -> Result<RunSummary> {
    config.validate()?;
    let paths = config.resolve_paths();
    paths.create_dirs()?;

    info!("Run {}: {}", paths.run_name, config);

    let model = GenericModel::<B>::new(&config.model, device)?;
    let mut trainer = SaliencyTrainer::new(model, config.clone(), device);

    if config.training.resume {
        match resume_target(&config, &paths.snapshot_dir)? {
            Some(checkpoint) => {
                trainer.restore(&checkpoint)?;
            }
            None => info!(
                "No checkpoint in {:?}, starting at epoch {}",
                paths.snapshot_dir, config.training.current_epoch
            ),
        }
    } else if config.training.restore_from.is_some() {
        warn!("Ignoring restore_from because resume is disabled");
    }

    if trainer.is_finished() {
        info!("Training Finished");
        return Ok(RunSummary {
            progress: trainer.progress(),
            optimizer_steps: 0,
            checkpoints: Vec::new(),
            already_complete: true,
        });
    }

    ensure_free_slots(&paths.snapshot_dir, trainer.progress(), config.training.epoch)?;

    let mut loader = build_loader::<B>(&config, &paths.train_list, device)?;
    let steps_per_epoch = loader.num_batches();

    config.append_train_record(&paths.record_file)?;

    let mut writer = SummaryWriter::new(&paths.log_dir, steps_per_epoch * trainer.progress().current_epoch)?;
    let progress = trainer.fit(loader.as_mut(), &mut writer, &paths.snapshot_dir)?;

    Ok(RunSummary {
        progress,
        optimizer_steps: trainer.optimizer_steps(),
        checkpoints: trainer.checkpoints().to_vec(),
        already_complete: false,
    })
}

use anyhow::{anyhow, Result};
use burn::module::{AutodiffModule, Module, ModuleVisitor, Param};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use super::metrics::{accuracy, eta_seconds, format_eta, report_interval, StepMetrics, TrainMeters};
use super::optim::{build_optimizer, AttentionOptimizer};
use super::schedule::build_scheduler;
use super::summary::SummaryWriter;
use super::TrainError;
use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointState, TrainingProgress};
use crate::config::{OptimizerKind, RunConfig};
use crate::data::{DataLoader, ImageBatch};
use crate::model::{GenericModel, LossWeighting, LossWeights};

pub struct SaliencyTrainer<B: AutodiffBackend> {
    model: GenericModel<B>,
    optimizer: Box<dyn AttentionOptimizer<B>>,
    weighting: LossWeighting,
    config: RunConfig,
    progress: TrainingProgress,
    state: CheckpointState,
    optimizer_steps: usize,
    checkpoints: Vec<PathBuf>,
    device: B::Device,
}

impl<B: AutodiffBackend> SaliencyTrainer<B> {
    /// The cursor starts from the configured epoch/counter overrides.
    pub fn new(model: GenericModel<B>, config: RunConfig, device: &B::Device) -> Self {
        let optimizer = build_optimizer::<B>(&config.training);
        let weighting = config.model.loss_weighting();
        let progress = TrainingProgress {
            current_epoch: config.training.current_epoch,
            global_step: config.training.global_counter,
        };

        Self {
            model,
            optimizer,
            weighting,
            config,
            progress,
            state: CheckpointState::NoCheckpoint,
            optimizer_steps: 0,
            checkpoints: Vec::new(),
            device: device.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: &Path) -> Result<TrainingProgress> {
        let (model, progress) =
            load_checkpoint(checkpoint, self.model.clone(), self.optimizer.as_mut(), &self.device)?;
        self.model = model;
        self.progress = progress;
        self.state = CheckpointState::Restored(progress);
        info!(
            "Restored {:?}: epoch {}, global step {}",
            checkpoint, progress.current_epoch, progress.global_step
        );
        Ok(progress)
    }

    pub fn is_finished(&self) -> bool {
        self.progress.current_epoch >= self.config.training.epoch
    }

    /// Loss weights for the step at the current global counter.
    ///
    /// Drawn from a generator keyed by `(seed, global step)`, so a resumed run
    /// sees the same sequence as an uninterrupted one.
    fn step_weights(&self) -> (LossWeights, Option<LossWeights>) {
        let mut rng = StdRng::seed_from_u64(
            self.config
                .training
                .seed
                .wrapping_add(self.progress.global_step as u64),
        );
        self.weighting.sample(&mut rng)
    }

    /// Weighted loss of `batch` under the current parameters, without updating them.
    ///
    /// Runs on the inner backend, so batch norm reads its running statistics
    /// and leaves them untouched.
    pub fn evaluate_loss(&self, batch: &ImageBatch<B>) -> Result<f32> {
        let (weights, coeffs) = self.step_weights();
        let model = self.model.valid();
        let labels = batch.labels.clone().inner();
        let output = model.forward(batch.images.clone().inner(), labels.clone(), coeffs.as_ref());
        let loss = model.compute_loss(output.logits, labels, output.masks, &weights);
        Ok(loss.total.into_scalar().elem::<f32>())
    }

    /// Forward, loss, backward and one optimizer step at rate `lr`.
    pub fn train_step(&mut self, batch: ImageBatch<B>, lr: f64) -> Result<StepMetrics> {
        let batch_size = batch.batch_size();
        let (weights, coeffs) = self.step_weights();

        let output = self
            .model
            .forward(batch.images, batch.labels.clone(), coeffs.as_ref());
        let logits = host_floats(output.logits.clone())?;
        let loss = self
            .model
            .compute_loss(output.logits, batch.labels.clone(), output.masks, &weights);

        let total = loss.total.clone().into_scalar().elem::<f32>();
        let ce = loss.ce.into_scalar().elem::<f32>();
        let mean_mask = loss.mean_mask.into_scalar().elem::<f32>();
        let variation_mask = loss.variation_mask.into_scalar().elem::<f32>();
        for (component, value) in [
            ("total loss", total),
            ("ce loss", ce),
            ("mean mask loss", mean_mask),
            ("variation mask loss", variation_mask),
        ] {
            if !value.is_finite() {
                return Err(TrainError::NonFinite {
                    component,
                    value,
                    step: self.progress.global_step,
                }
                .into());
            }
        }

        let grads = loss.total.backward();
        if let Some(value) = non_finite_gradient(&self.model, &grads) {
            return Err(TrainError::NonFinite {
                component: "attention gradient",
                value,
                step: self.progress.global_step,
            }
            .into());
        }
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        self.optimizer_steps += 1;

        let labels = host_labels(batch.labels)?;
        let precision = accuracy(&logits, self.config.model.num_classes, &labels, &[1, 5]);

        Ok(StepMetrics {
            batch_size,
            total,
            ce,
            mean_mask,
            variation_mask,
            top1: precision[0],
            top5: precision[1],
        })
    }

    /// Run the remaining epochs, saving a checkpoint after each one.
    pub fn fit(
        &mut self,
        loader: &mut dyn DataLoader<B>,
        writer: &mut SummaryWriter,
        snapshot_dir: &Path,
    ) -> Result<TrainingProgress> {
        let steps_per_epoch = loader.num_batches();
        if steps_per_epoch == 0 {
            return Err(TrainError::EmptyEpoch.into());
        }

        let training = self.config.training.clone();
        let total_epoch = training.epoch;
        let per_step = training.schedule.is_per_step();
        let interval = report_interval(steps_per_epoch);
        let mut scheduler = build_scheduler(
            &training,
            steps_per_epoch,
            self.progress.current_epoch,
            self.progress.global_step,
        )?;

        info!("Max iter: {}", total_epoch * steps_per_epoch);
        debug!("Checkpoint state {:?} -> Training", self.state);
        self.state = CheckpointState::Training;

        let mut meters = TrainMeters::default();
        while self.progress.current_epoch < total_epoch {
            let epoch = self.progress.current_epoch;
            meters.reset_all();
            loader.reset(epoch);
            let bar = self.progress_bar(steps_per_epoch, epoch)?;

            let mut batch_idx = 0;
            let mut end = Instant::now();
            while let Some(batch) = loader.next_batch()? {
                let lr = scheduler.get_lr();
                let step = self.train_step(batch, lr)?;
                if per_step {
                    scheduler.step();
                }

                meters.update(&step);
                meters.batch_time.update(end.elapsed().as_secs_f64(), 1.0);
                end = Instant::now();

                let global_step = self.progress.global_step;
                if global_step % interval == 0 {
                    let eta = eta_seconds(
                        total_epoch,
                        epoch,
                        steps_per_epoch,
                        batch_idx,
                        meters.batch_time.average(),
                    );
                    bar.set_message(format!(
                        "loss {:.4} ce {:.4} mean {:.4} var {:.4} top1 {:.1} eta {}",
                        meters.losses.average(),
                        meters.ce.average(),
                        meters.mean_mask.average(),
                        meters.variation_mask.average(),
                        meters.top1.average(),
                        format_eta(eta),
                    ));
                    self.report(writer, &meters, scheduler.get_lr(), global_step)?;
                    meters.reset_window();
                }

                bar.inc(1);
                self.progress.global_step += 1;
                batch_idx += 1;
            }
            bar.finish_and_clear();

            self.progress.current_epoch += 1;
            let path = save_checkpoint(&self.model, self.optimizer.as_ref(), self.progress, snapshot_dir)?;
            self.checkpoints.push(path);
            self.state = CheckpointState::Saved(self.progress.current_epoch);
            debug!("Checkpoint state -> {:?}", self.state);

            info!(
                "Epoch {}/{} done: {} batches, loss {:.4} (CE {:.4}, mean {:.4}, var {:.4}), top1 {:.2}, top5 {:.2}, {:.3}s/batch",
                self.progress.current_epoch,
                total_epoch,
                batch_idx,
                meters.losses.average(),
                meters.ce.average(),
                meters.mean_mask.average(),
                meters.variation_mask.average(),
                meters.top1.average(),
                meters.top5.average(),
                meters.batch_time.average(),
            );

            if !per_step {
                scheduler.step();
            }
        }

        info!("Training Finished");
        Ok(self.progress)
    }

    fn report(&self, writer: &mut SummaryWriter, meters: &TrainMeters, lr: f64, step: usize) -> Result<()> {
        writer.add_scalars(
            "Losses",
            &[
                ("Total Loss", meters.losses.average()),
                ("Mean Loss", meters.mean_mask.average()),
                ("Var Loss", meters.variation_mask.average()),
                ("CE Loss", meters.ce.average()),
            ],
            step,
        )?;
        writer.add_scalars(
            "Precision",
            &[("Top 1", meters.top1.average()), ("Top 5", meters.top5.average())],
            step,
        )?;

        let lrs = self.optimizer.group_lrs(lr);
        match self.optimizer.kind() {
            OptimizerKind::Sgd => writer.add_scalars("LR", &[("Weight", lrs[0]), ("Bias", lrs[1])], step)?,
            OptimizerKind::AdamW => writer.add_scalar("LR", lrs[0], step)?,
        }
        writer.flush()
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> Result<ProgressBar> {
        if !self.config.training.progress {
            return Ok(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::with_template("[epoch {prefix}] {elapsed_precise} {bar:40.cyan/blue} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );
        bar.set_prefix(epoch.to_string());
        Ok(bar)
    }

    pub fn model(&self) -> &GenericModel<B> {
        &self.model
    }

    pub fn progress(&self) -> TrainingProgress {
        self.progress
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    /// Optimizer steps taken by this process.
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    /// Checkpoints written by this process, oldest first.
    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    pub fn group_lrs(&self, lr: f64) -> Vec<f64> {
        self.optimizer.group_lrs(lr)
    }
}

/// Sums each attention gradient and keeps the first non-finite total.
struct GradientCheck<'a, B: AutodiffBackend> {
    grads: &'a B::Gradients,
    found: Option<f32>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientCheck<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.found.is_some() {
            return;
        }
        if let Some(grad) = param.val().grad(self.grads) {
            let total = grad.sum().into_scalar().elem::<f32>();
            if !total.is_finite() {
                self.found = Some(total);
            }
        }
    }
}

/// A NaN or infinity anywhere in the attention gradients, if there is one.
fn non_finite_gradient<B: AutodiffBackend>(model: &GenericModel<B>, grads: &B::Gradients) -> Option<f32> {
    let mut check = GradientCheck::<B> { grads, found: None };
    model.attn_mech.visit(&mut check);
    check.found
}

fn host_floats<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor: {:?}", e))
}

fn host_labels<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow!("Failed to read labels: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackboneKind, ModelConfig, TrainingConfig, HYPER_ARRANGEMENT};
    use crate::data::SyntheticDataLoader;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config(epoch: usize) -> RunConfig {
        RunConfig {
            model: ModelConfig {
                backbone: BackboneKind::Vgg16,
                num_classes: 4,
                base_width: 2,
                classifier_hidden: 8,
                attention_hidden: 4,
                ..ModelConfig::default()
            },
            training: TrainingConfig {
                batch_size: 2,
                input_size: 32,
                crop_size: 32,
                epoch,
                progress: false,
                ..TrainingConfig::default()
            },
            ..RunConfig::default()
        }
    }

    fn trainer(config: RunConfig) -> SaliencyTrainer<TestBackend> {
        let device = Default::default();
        let model = GenericModel::new(&config.model, &device).unwrap();
        SaliencyTrainer::new(model, config, &device)
    }

    #[test]
    fn test_train_step_reports_finite_metrics() {
        let mut trainer = trainer(tiny_config(1));
        let loader = SyntheticDataLoader::<TestBackend>::new(2, 32, 4, 1, 0, Default::default());

        let step = trainer.train_step(loader.batch_at(0, 0), 1e-3).unwrap();
        assert_eq!(step.batch_size, 2);
        assert!(step.total.is_finite());
        assert!(step.top1 <= step.top5);
        assert_eq!(trainer.optimizer_steps(), 1);
    }

    #[test]
    fn test_fit_counts_steps_and_saves_each_epoch() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(tiny_config(2));
        let mut loader = SyntheticDataLoader::<TestBackend>::new(2, 32, 4, 3, 0, Default::default());
        let mut writer = SummaryWriter::new(&dir.path().join("logs"), 0).unwrap();

        let progress = trainer.fit(&mut loader, &mut writer, dir.path()).unwrap();
        assert_eq!(
            progress,
            TrainingProgress {
                current_epoch: 2,
                global_step: 6
            }
        );
        assert_eq!(trainer.optimizer_steps(), 6);
        assert_eq!(trainer.checkpoints().len(), 2);
        assert_eq!(trainer.state(), CheckpointState::Saved(2));
    }

    #[test]
    fn test_nan_batch_fails_without_stepping() {
        let mut trainer = trainer(tiny_config(1));
        let loader = SyntheticDataLoader::<TestBackend>::new(2, 32, 4, 1, 0, Default::default());
        let batch = loader.batch_at(0, 0);
        let batch = ImageBatch::new(batch.images.mul_scalar(f32::NAN), batch.labels);

        let err = trainer.train_step(batch, 1e-3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::NonFinite { step: 0, .. })
        ));
        assert_eq!(trainer.optimizer_steps(), 0);
    }

    #[test]
    fn test_non_finite_gradient_is_detected() {
        let trainer = trainer(tiny_config(1));
        let loader = SyntheticDataLoader::<TestBackend>::new(2, 32, 4, 1, 0, Default::default());
        let batch = loader.batch_at(0, 0);
        let model = trainer.model();

        let output = model.forward(batch.images.clone(), batch.labels.clone(), None);
        let healthy = model
            .compute_loss(output.logits, batch.labels.clone(), output.masks, &LossWeights::default())
            .total
            .backward();
        assert_eq!(non_finite_gradient(model, &healthy), None);

        // sqrt at zero: the loss is 0 but its gradient is NaN.
        let output = model.forward(batch.images, batch.labels, None);
        let broken = output.masks.mul_scalar(0.0).sqrt().sum().backward();
        let value = non_finite_gradient(model, &broken).unwrap();
        assert!(value.is_nan());
    }

    #[test]
    fn test_evaluation_leaves_batch_norm_statistics_alone() {
        let mut config = tiny_config(1);
        config.model.backbone = BackboneKind::Resnet50;
        config.model.layers = vec!["layer3".to_string()];
        config.model.freeze_bn = false;
        let trainer = trainer(config);
        let loader = SyntheticDataLoader::<TestBackend>::new(2, 32, 4, 1, 0, Default::default());
        let batch = loader.batch_at(0, 0);

        let logits = |trainer: &SaliencyTrainer<TestBackend>| {
            trainer
                .model()
                .valid()
                .body
                .forward(batch.images.clone().inner())
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        let before = logits(&trainer);
        let first = trainer.evaluate_loss(&batch).unwrap();
        assert_eq!(trainer.evaluate_loss(&batch).unwrap(), first);
        assert_eq!(logits(&trainer), before);
    }

    #[test]
    fn test_randomized_weights_follow_global_step() {
        let mut config = tiny_config(1);
        config.model.arrangement = HYPER_ARRANGEMENT.to_string();
        let mut trainer = trainer(config);

        let (a, coeffs) = trainer.step_weights();
        assert_eq!(coeffs, Some(a));
        assert_eq!(trainer.step_weights().0, a);

        trainer.progress.global_step += 1;
        assert_ne!(trainer.step_weights().0, a);
    }
}

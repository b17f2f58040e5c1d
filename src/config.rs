use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{resolve_taps, LossWeighting};

/// Name of the per-run configuration history file.
pub const TRAIN_RECORD_FILE: &str = "train_record.json";

/// Arrangement tag that turns on per-batch randomized loss weighting.
pub const HYPER_ARRANGEMENT: &str = "hyper";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown layer `{layer}` for backbone {backbone}")]
    UnknownLayer { backbone: BackboneKind, layer: String },
    #[error("at least one target layer is required")]
    NoLayers,
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("crop size {crop} exceeds input size {input}")]
    CropTooLarge { crop: usize, input: usize },
    #[error("{field} must be a positive finite number, got {value}")]
    BadRate { field: &'static str, value: f64 },
    #[error("max_lr ({max}) must not be below base_lr ({base}) for the {schedule} schedule")]
    InvertedRange { base: f64, max: f64, schedule: ScheduleKind },
    #[error("beta2 must be within [0, 1), got {0}")]
    BadBeta(f64),
    #[error("current epoch override {current} is beyond the epoch count {total}")]
    EpochOverride { current: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Resnet50,
    Vgg16,
}

impl BackboneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackboneKind::Resnet50 => "resnet50",
            BackboneKind::Vgg16 => "vgg16",
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Multiply the learning rate by `gamma` after every epoch.
    Step,
    /// Triangular cycle between `base_lr` and `max_lr`, one cycle per epoch.
    Cyclic,
    /// Cosine warm-up to `max_lr` and anneal over the whole run.
    Onecycle,
}

impl ScheduleKind {
    /// Per-step schedules advance after every optimizer step, the others once per epoch.
    pub fn is_per_step(&self) -> bool {
        !matches!(self, ScheduleKind::Step)
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleKind::Step => "step",
            ScheduleKind::Cyclic => "cyclic",
            ScheduleKind::Onecycle => "onecycle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum OptimizerKind {
    #[value(name = "SGD")]
    #[serde(rename = "SGD")]
    Sgd,
    #[value(name = "AdamW")]
    #[serde(rename = "AdamW")]
    AdamW,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => f.write_str("SGD"),
            OptimizerKind::AdamW => f.write_str("AdamW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub root_dir: PathBuf,
    pub img_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub train_list: PathBuf,
    /// Declared for completeness, never read by the training loop.
    pub eval_list: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            img_dir: PathBuf::from("/m2/ILSVRC2012_img_train"),
            snapshot_dir: PathBuf::from("snapshots"),
            train_list: PathBuf::from("VGG16_train.txt"),
            eval_list: PathBuf::from("Evaluation_2000.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backbone: BackboneKind,
    /// Backbone layers whose activations feed the attention module.
    pub layers: Vec<String>,
    pub version: String,
    /// Free-form suffix appended to the run name.
    pub arch: String,
    pub arrangement: String,
    pub freeze_bn: bool,
    pub num_classes: usize,
    pub base_width: usize,
    pub classifier_hidden: usize,
    pub attention_hidden: usize,
    pub backbone_weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::Vgg16,
            layers: vec!["features.29".to_string()],
            version: "V1".to_string(),
            arch: String::new(),
            arrangement: "1-1".to_string(),
            freeze_bn: false,
            num_classes: 1000,
            base_width: 64,
            classifier_hidden: 4096,
            attention_hidden: 256,
            backbone_weights: None,
        }
    }
}

impl ModelConfig {
    /// `<model>_<version><arch>`, shared by snapshot and log directories.
    pub fn run_name(&self) -> String {
        format!("{}_{}{}", self.backbone, self.version, self.arch)
    }

    /// Loss weighting variant, decided once from the arrangement tag.
    pub fn loss_weighting(&self) -> LossWeighting {
        if self.arrangement == HYPER_ARRANGEMENT {
            LossWeighting::Randomized
        } else {
            LossWeighting::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::Zero { field: "num_classes" });
        }
        if self.base_width == 0 {
            return Err(ConfigError::Zero { field: "base_width" });
        }
        if self.classifier_hidden == 0 {
            return Err(ConfigError::Zero { field: "classifier_hidden" });
        }
        if self.attention_hidden == 0 {
            return Err(ConfigError::Zero { field: "attention_hidden" });
        }
        resolve_taps(self.backbone, &self.layers)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub input_size: usize,
    pub crop_size: usize,
    pub num_workers: usize,
    pub resume: bool,
    pub restore_from: Option<PathBuf>,
    pub base_lr: f64,
    pub max_lr: f64,
    pub gamma: f64,
    pub epoch: usize,
    pub current_epoch: usize,
    pub global_counter: usize,
    pub schedule: ScheduleKind,
    pub optimizer: OptimizerKind,
    pub weight_decay: f64,
    pub beta2: f64,
    pub seed: u64,
    /// Replace the image list with this many synthetic batches per epoch.
    pub synthetic_steps: Option<usize>,
    pub progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            input_size: 256,
            crop_size: 224,
            num_workers: 1,
            resume: true,
            restore_from: None,
            base_lr: 3e-7,
            max_lr: 5e-5,
            gamma: 0.75,
            epoch: 8,
            current_epoch: 0,
            global_counter: 0,
            schedule: ScheduleKind::Onecycle,
            optimizer: OptimizerKind::Sgd,
            weight_decay: 5e-4,
            beta2: 0.999,
            seed: 0,
            synthetic_steps: None,
            progress: true,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("batch_size", self.batch_size),
            ("input_size", self.input_size),
            ("crop_size", self.crop_size),
            ("epoch", self.epoch),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.crop_size > self.input_size {
            return Err(ConfigError::CropTooLarge {
                crop: self.crop_size,
                input: self.input_size,
            });
        }
        for (field, value) in [("base_lr", self.base_lr), ("max_lr", self.max_lr), ("gamma", self.gamma)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::BadRate { field, value });
            }
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ConfigError::BadRate {
                field: "weight_decay",
                value: self.weight_decay,
            });
        }
        if self.schedule.is_per_step() && self.max_lr < self.base_lr {
            return Err(ConfigError::InvertedRange {
                base: self.base_lr,
                max: self.max_lr,
                schedule: self.schedule,
            });
        }
        if !(0.0..1.0).contains(&self.beta2) {
            return Err(ConfigError::BadBeta(self.beta2));
        }
        if self.current_epoch > self.epoch {
            return Err(ConfigError::EpochOverride {
                current: self.current_epoch,
                total: self.epoch,
            });
        }
        if self.synthetic_steps == Some(0) {
            return Err(ConfigError::Zero { field: "synthetic_steps" });
        }
        Ok(())
    }
}

/// Complete, immutable description of one training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub paths: PathConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.training.validate()
    }

    pub fn resolve_paths(&self) -> RunPaths {
        RunPaths::resolve(self)
    }

    /// Append this configuration to the run's `train_record.json`.
    ///
    /// Every run adds one pretty-printed object followed by a blank line, so the
    /// file accumulates the history of configurations used in the directory.
    pub fn append_train_record(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)
            .with_context(|| "Failed to serialize run configuration")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open train record: {:?}", path))?;
        file.write_all(&buf)
            .and_then(|_| file.write_all(b"\n\n"))
            .with_context(|| format!("Failed to append train record: {:?}", path))?;
        Ok(())
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Directories and files derived from a [`RunConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub run_name: String,
    pub snapshot_dir: PathBuf,
    pub log_dir: PathBuf,
    pub train_list: PathBuf,
    pub record_file: PathBuf,
}

impl RunPaths {
    pub fn resolve(config: &RunConfig) -> Self {
        let run_name = config.model.run_name();
        let snapshot_dir = config.paths.snapshot_dir.join(&run_name);
        let log_dir = config
            .paths
            .snapshot_dir
            .join("data")
            .join("logs")
            .join(&run_name);
        let train_list = resolve_list(&config.paths.root_dir, &config.paths.train_list);
        let record_file = snapshot_dir.join(TRAIN_RECORD_FILE);

        Self {
            run_name,
            snapshot_dir,
            log_dir,
            train_list,
            record_file,
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.snapshot_dir)
            .with_context(|| format!("Failed to create snapshot directory: {:?}", self.snapshot_dir))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create log directory: {:?}", self.log_dir))?;
        Ok(())
    }
}

/// Relative image lists live under `<root>/datalist/ILSVRC/`.
fn resolve_list(root: &Path, list: &Path) -> PathBuf {
    if list.is_absolute() {
        list.to_path_buf()
    } else {
        root.join("datalist").join("ILSVRC").join(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(RunConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_run_paths_are_derived_without_mutation() {
        let mut config = RunConfig::default();
        config.paths.snapshot_dir = PathBuf::from("/tmp/snaps");
        config.paths.root_dir = PathBuf::from("/proj");
        config.model.arch = "_x".to_string();

        let paths = config.resolve_paths();
        assert_eq!(paths.run_name, "vgg16_V1_x");
        assert_eq!(paths.snapshot_dir, PathBuf::from("/tmp/snaps/vgg16_V1_x"));
        assert_eq!(paths.log_dir, PathBuf::from("/tmp/snaps/data/logs/vgg16_V1_x"));
        assert_eq!(
            paths.train_list,
            PathBuf::from("/proj/datalist/ILSVRC/VGG16_train.txt")
        );
        assert_eq!(config.paths.snapshot_dir, PathBuf::from("/tmp/snaps"));
    }

    #[test]
    fn test_absolute_train_list_is_kept() {
        let mut config = RunConfig::default();
        config.paths.train_list = PathBuf::from("/data/list.txt");
        assert_eq!(config.resolve_paths().train_list, PathBuf::from("/data/list.txt"));
    }

    #[test]
    fn test_unknown_layer_is_rejected() {
        let mut config = RunConfig::default();
        config.model.layers = vec!["layer3".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownLayer { .. })
        ));
    }

    #[test]
    fn test_epoch_override_beyond_total_is_rejected() {
        let mut config = RunConfig::default();
        config.training.current_epoch = 9;
        assert_eq!(
            config.validate(),
            Err(ConfigError::EpochOverride { current: 9, total: 8 })
        );
    }

    #[test]
    fn test_inverted_lr_range_only_matters_for_cyclic_schedules() {
        let mut config = RunConfig::default();
        config.training.base_lr = 1e-3;
        config.training.max_lr = 1e-4;
        assert!(config.validate().is_err());

        config.training.schedule = ScheduleKind::Step;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hyper_arrangement_selects_randomized_weighting() {
        let mut model = ModelConfig::default();
        assert!(matches!(model.loss_weighting(), LossWeighting::Fixed(_)));
        model.arrangement = HYPER_ARRANGEMENT.to_string();
        assert!(matches!(model.loss_weighting(), LossWeighting::Randomized));
    }

    #[test]
    fn test_train_record_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TRAIN_RECORD_FILE);
        let config = RunConfig::default();

        config.append_train_record(&path).unwrap();
        config.append_train_record(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("\"backbone\": \"vgg16\"").count(), 2);
        assert!(text.ends_with("}\n\n"));
        assert!(text.contains("\n    \"paths\""));
    }
}

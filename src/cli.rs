use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{BackboneKind, ModelConfig, OptimizerKind, PathConfig, RunConfig, ScheduleKind, TrainingConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Saliency attention training CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Train the attention module on top of a frozen backbone
    Train(TrainArgs),
    /// List the checkpoints of a run
    Checkpoints(CheckpointsArgs),
}

#[derive(Debug, Args)]
pub struct TrainArgs {
    /// Root dir for the project
    #[arg(long, default_value = ".")]
    pub root_dir: PathBuf,

    /// Directory of training images
    #[arg(long, default_value = "/m2/ILSVRC2012_img_train")]
    pub img_dir: PathBuf,

    #[arg(long, default_value = "snapshots")]
    pub snapshot_dir: PathBuf,

    /// Checkpoint to resume from; defaults to the latest in the run's snapshot directory
    #[arg(long)]
    pub restore_from: Option<String>,

    /// Image list, relative to <root-dir>/datalist/ILSVRC unless absolute
    #[arg(long, default_value = "VGG16_train.txt")]
    pub train_list: PathBuf,

    #[arg(long, default_value = "Evaluation_2000.txt")]
    pub eval_list: PathBuf,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 256)]
    pub input_size: usize,

    #[arg(long, default_value_t = 224)]
    pub crop_size: usize,

    #[arg(long, default_value_t = 1)]
    pub num_workers: usize,

    #[arg(long, default_value = "true", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub resume: bool,

    /// Suffix for the run name
    #[arg(long, default_value = "")]
    pub arch: String,

    #[arg(long = "model", value_enum, default_value_t = BackboneKind::Vgg16)]
    pub backbone: BackboneKind,

    /// Whitespace-separated backbone layers feeding the attention module
    #[arg(long, default_value = "features.29")]
    pub layers: String,

    #[arg(long, default_value = "false", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub freeze_bn: bool,

    #[arg(long = "version", default_value = "V1")]
    pub model_version: String,

    /// `hyper` draws fresh loss weights for every batch
    #[arg(long, default_value = "1-1")]
    pub arrangement: String,

    #[arg(long, default_value_t = 3e-7)]
    pub base_lr: f64,

    #[arg(long, default_value_t = 5e-5)]
    pub max_lr: f64,

    /// Per-epoch decay factor of the step schedule
    #[arg(long, default_value_t = 0.75)]
    pub gamma: f64,

    #[arg(long, default_value_t = 8)]
    pub epoch: usize,

    #[arg(long, default_value_t = 0)]
    pub current_epoch: usize,

    #[arg(long, default_value_t = 0)]
    pub global_counter: usize,

    #[arg(long, value_enum, default_value_t = ScheduleKind::Onecycle)]
    pub schedule: ScheduleKind,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Sgd)]
    pub optim: OptimizerKind,

    /// Weight decay
    #[arg(long, default_value_t = 5e-4)]
    pub wd: f64,

    /// AdamW beta2
    #[arg(long, default_value_t = 0.999)]
    pub b2: f64,

    #[arg(long, default_value_t = 1000)]
    pub num_classes: usize,

    /// Channel width of the first backbone stage
    #[arg(long, default_value_t = 64)]
    pub base_width: usize,

    #[arg(long, default_value_t = 4096)]
    pub classifier_hidden: usize,

    #[arg(long, default_value_t = 256)]
    pub attention_hidden: usize,

    /// Pretrained backbone record (.mpk)
    #[arg(long)]
    pub backbone_weights: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Train on this many synthetic batches per epoch instead of the image list
    #[arg(long)]
    pub synthetic_steps: Option<usize>,

    #[arg(long)]
    pub no_progress: bool,
}

impl TrainArgs {
    pub fn into_run_config(self) -> RunConfig {
        let restore_from = self.restore_from.filter(|p| !p.is_empty()).map(PathBuf::from);

        RunConfig {
            paths: PathConfig {
                root_dir: self.root_dir,
                img_dir: self.img_dir,
                snapshot_dir: self.snapshot_dir,
                train_list: self.train_list,
                eval_list: self.eval_list,
            },
            model: ModelConfig {
                backbone: self.backbone,
                layers: self.layers.split_whitespace().map(str::to_string).collect(),
                version: self.model_version,
                arch: self.arch,
                arrangement: self.arrangement,
                freeze_bn: self.freeze_bn,
                num_classes: self.num_classes,
                base_width: self.base_width,
                classifier_hidden: self.classifier_hidden,
                attention_hidden: self.attention_hidden,
                backbone_weights: self.backbone_weights,
            },
            training: TrainingConfig {
                batch_size: self.batch_size,
                input_size: self.input_size,
                crop_size: self.crop_size,
                num_workers: self.num_workers,
                resume: self.resume,
                restore_from,
                base_lr: self.base_lr,
                max_lr: self.max_lr,
                gamma: self.gamma,
                epoch: self.epoch,
                current_epoch: self.current_epoch,
                global_counter: self.global_counter,
                schedule: self.schedule,
                optimizer: self.optim,
                weight_decay: self.wd,
                beta2: self.b2,
                seed: self.seed,
                synthetic_steps: self.synthetic_steps,
                progress: !self.no_progress,
            },
        }
    }
}

#[derive(Debug, Args)]
pub struct CheckpointsArgs {
    #[arg(long, default_value = "snapshots")]
    pub snapshot_dir: PathBuf,

    #[arg(long = "model", value_enum, default_value_t = BackboneKind::Vgg16)]
    pub backbone: BackboneKind,

    #[arg(long = "version", default_value = "V1")]
    pub model_version: String,

    #[arg(long, default_value = "")]
    pub arch: String,
}

impl CheckpointsArgs {
    pub fn run_dir(&self) -> PathBuf {
        let model = ModelConfig {
            backbone: self.backbone,
            version: self.model_version.clone(),
            arch: self.arch.clone(),
            ..ModelConfig::default()
        };
        self.snapshot_dir.join(model.run_name())
    }
}
